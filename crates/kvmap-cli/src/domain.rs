//! Domain types of the demo scenario.

use std::any::Any;

use kvmap_model::{
    object_ref, AccessError, CascadePolicy, DeclaredSyntaxStrategy, EntityBuilder,
    MappingContext, ModelResult, ObjectRef, Persistent, PersistentCollection, PropertyBuilder,
    PropertyValue,
};
use kvmap_types::{Value, ValueType};

pub const AUTHOR: &str = "demo.Author";
pub const BOOK: &str = "demo.Book";

fn scalar(name: &str, value: PropertyValue) -> Result<Value, AccessError> {
    value
        .into_scalar()
        .ok_or_else(|| AccessError::unexpected(name, "scalar"))
}

#[derive(Default)]
pub struct Author {
    pub id: Option<i64>,
    pub name: String,
    pub books: Option<PersistentCollection>,
}

impl Persistent for Author {
    fn entity_name(&self) -> &str {
        AUTHOR
    }

    fn get_property(&self, name: &str) -> Option<PropertyValue> {
        Some(match name {
            "id" => Value::from(self.id).into(),
            "name" => Value::from(self.name.as_str()).into(),
            "books" => self
                .books
                .clone()
                .map_or_else(PropertyValue::null, PropertyValue::Collection),
            _ => return None,
        })
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), AccessError> {
        match name {
            "id" => self.id = scalar(name, value)?.as_i64(),
            "name" => self.name = scalar(name, value)?.into_string().unwrap_or_default(),
            "books" => {
                self.books = value
                    .into_collection()
                    .ok_or_else(|| AccessError::unexpected(name, "collection"))?;
            }
            _ => return Err(AccessError::unknown(name)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[derive(Default)]
pub struct Book {
    pub id: Option<i64>,
    pub title: String,
    pub author: Option<ObjectRef>,
}

impl Persistent for Book {
    fn entity_name(&self) -> &str {
        BOOK
    }

    fn get_property(&self, name: &str) -> Option<PropertyValue> {
        Some(match name {
            "id" => Value::from(self.id).into(),
            "title" => Value::from(self.title.as_str()).into(),
            "author" => PropertyValue::Object(self.author.clone()),
            _ => return None,
        })
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), AccessError> {
        match name {
            "id" => self.id = scalar(name, value)?.as_i64(),
            "title" => self.title = scalar(name, value)?.into_string().unwrap_or_default(),
            "author" => {
                self.author = value
                    .into_object()
                    .ok_or_else(|| AccessError::unexpected(name, "object"))?;
            }
            _ => return Err(AccessError::unknown(name)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Authors own their books; books point back through `author_id`.
pub fn mapping_context() -> ModelResult<MappingContext> {
    let author = EntityBuilder::new(AUTHOR)
        .family("authors")
        .factory(|| object_ref(Author::default()))
        .identity(PropertyBuilder::identity("id", ValueType::Int))
        .property(PropertyBuilder::simple("name", ValueType::Text).indexed())
        .property(PropertyBuilder::one_to_many("books", BOOK).cascade(CascadePolicy::ALL))
        .build()?;
    let book = EntityBuilder::new(BOOK)
        .family("books")
        .factory(|| object_ref(Book::default()))
        .identity(PropertyBuilder::identity("id", ValueType::Int))
        .property(PropertyBuilder::simple("title", ValueType::Text))
        .property(PropertyBuilder::to_one("author", AUTHOR).key("author_id"))
        .build()?;
    MappingContext::from_declarations(DeclaredSyntaxStrategy::new().with(author).with(book))
}
