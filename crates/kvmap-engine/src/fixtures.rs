//! Domain types and mapping shared by the engine tests.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use kvmap_model::{
    object_ref, with_object, with_object_mut, AccessError, CascadePolicy, DeclaredSyntaxStrategy,
    EntityBuilder, EntityDeclaration, FetchStrategy, MappingContext, ObjectRef,
    PersistentCollection, PersistentList, Persistent, PropertyBuilder, PropertyValue,
};
use kvmap_types::{Value, ValueType};

use crate::config::DatastoreConfig;
use crate::datastore::Datastore;
use crate::memory::{InMemoryBackend, InMemoryStore};
use crate::session::Session;

pub const AUTHOR: &str = "test.Author";
pub const BOOK: &str = "test.Book";
pub const PUBLISHER: &str = "test.Publisher";
pub const ADDRESS: &str = "test.Address";

fn scalar(name: &str, value: PropertyValue) -> Result<Value, AccessError> {
    value
        .into_scalar()
        .ok_or_else(|| AccessError::unexpected(name, "scalar"))
}

fn object(name: &str, value: PropertyValue) -> Result<Option<ObjectRef>, AccessError> {
    value
        .into_object()
        .ok_or_else(|| AccessError::unexpected(name, "object"))
}

macro_rules! any_impls {
    () => {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    };
}

#[derive(Default)]
pub struct Author {
    pub id: Option<i64>,
    pub name: String,
    pub books: Option<PersistentCollection>,
    pub address: Option<ObjectRef>,
    pub publisher: Option<ObjectRef>,
}

impl Author {
    pub fn named(name: &str) -> ObjectRef {
        object_ref(Self {
            name: name.to_string(),
            ..Self::default()
        })
    }
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
            "address" => PropertyValue::Object(self.address.clone()),
            "publisher" => PropertyValue::Object(self.publisher.clone()),
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
            "address" => self.address = object(name, value)?,
            "publisher" => self.publisher = object(name, value)?,
            _ => return Err(AccessError::unknown(name)),
        }
        Ok(())
    }

    any_impls!();
}

#[derive(Default)]
pub struct Book {
    pub id: Option<i64>,
    pub title: String,
    pub author: Option<ObjectRef>,
}

impl Book {
    pub fn titled(title: &str) -> ObjectRef {
        object_ref(Self {
            title: title.to_string(),
            ..Self::default()
        })
    }
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
            "author" => self.author = object(name, value)?,
            _ => return Err(AccessError::unknown(name)),
        }
        Ok(())
    }

    any_impls!();
}

#[derive(Default)]
pub struct Address {
    pub street: String,
    pub city: String,
}

impl Address {
    pub fn at(street: &str, city: &str) -> ObjectRef {
        object_ref(Self {
            street: street.to_string(),
            city: city.to_string(),
        })
    }
}

impl Persistent for Address {
    fn entity_name(&self) -> &str {
        ADDRESS
    }

    fn get_property(&self, name: &str) -> Option<PropertyValue> {
        Some(match name {
            "street" => Value::from(self.street.as_str()).into(),
            "city" => Value::from(self.city.as_str()).into(),
            _ => return None,
        })
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), AccessError> {
        let text = scalar(name, value)?.into_string().unwrap_or_default();
        match name {
            "street" => self.street = text,
            "city" => self.city = text,
            _ => return Err(AccessError::unknown(name)),
        }
        Ok(())
    }

    any_impls!();
}

#[derive(Default)]
pub struct Publisher {
    pub id: Option<String>,
    pub name: String,
}

impl Publisher {
    pub fn named(name: &str) -> ObjectRef {
        object_ref(Self {
            id: None,
            name: name.to_string(),
        })
    }
}

impl Persistent for Publisher {
    fn entity_name(&self) -> &str {
        PUBLISHER
    }

    fn get_property(&self, name: &str) -> Option<PropertyValue> {
        Some(match name {
            "id" => Value::from(self.id.clone()).into(),
            "name" => Value::from(self.name.as_str()).into(),
            _ => return None,
        })
    }

    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), AccessError> {
        let value = scalar(name, value)?;
        match name {
            "id" => self.id = value.into_string(),
            "name" => self.name = value.into_string().unwrap_or_default(),
            _ => return Err(AccessError::unknown(name)),
        }
        Ok(())
    }

    any_impls!();
}

// ---------------------------------------------------------------
// Mapping
// ---------------------------------------------------------------

pub fn author_declaration(books_fetch: Option<FetchStrategy>) -> EntityDeclaration {
    let mut books = PropertyBuilder::one_to_many("books", BOOK).cascade(CascadePolicy::ALL);
    if let Some(fetch) = books_fetch {
        books = books.fetch(fetch);
    }
    EntityBuilder::new(AUTHOR)
        .family("authors")
        .factory(|| object_ref(Author::default()))
        .identity(PropertyBuilder::identity("id", ValueType::Int))
        .property(PropertyBuilder::simple("name", ValueType::Text).indexed())
        .property(
            PropertyBuilder::embedded(
                "address",
                ADDRESS,
                [
                    PropertyBuilder::simple("street", ValueType::Text),
                    PropertyBuilder::simple("city", ValueType::Text),
                ],
            )
            .embedded_factory(|| object_ref(Address::default())),
        )
        .property(PropertyBuilder::to_one("publisher", PUBLISHER).cascade(CascadePolicy::SAVE))
        .property(books)
        .build()
        .expect("author declaration")
}

pub fn book_declaration() -> EntityDeclaration {
    EntityBuilder::new(BOOK)
        .family("books")
        .factory(|| object_ref(Book::default()))
        .identity(PropertyBuilder::identity("id", ValueType::Int))
        .property(PropertyBuilder::simple("title", ValueType::Text))
        .property(PropertyBuilder::to_one("author", AUTHOR).key("author_id"))
        .build()
        .expect("book declaration")
}

pub fn publisher_declaration() -> EntityDeclaration {
    EntityBuilder::new(PUBLISHER)
        .family("publishers")
        .factory(|| object_ref(Publisher::default()))
        .identity(PropertyBuilder::identity("id", ValueType::Text).generator("uuid"))
        .property(PropertyBuilder::simple("name", ValueType::Text))
        .build()
        .expect("publisher declaration")
}

pub fn context_with(author: EntityDeclaration) -> Arc<MappingContext> {
    let declarations = DeclaredSyntaxStrategy::new()
        .with(author)
        .with(book_declaration())
        .with(publisher_declaration());
    Arc::new(MappingContext::from_declarations(declarations).expect("mapping context"))
}

/// Datastore over a fresh in-memory backend, plus a handle on its store.
pub fn datastore_with(
    context: Arc<MappingContext>,
    config: DatastoreConfig,
) -> (Arc<Datastore>, InMemoryStore) {
    let store = InMemoryStore::new();
    let backend = Arc::new(InMemoryBackend::with_store(store.clone()));
    let datastore = Arc::new(Datastore::new(context, backend).with_config(config));
    (datastore, store)
}

pub fn datastore() -> (Arc<Datastore>, InMemoryStore) {
    datastore_with(context_with(author_declaration(None)), DatastoreConfig::default())
}

pub fn session() -> (Session, InMemoryStore) {
    let (datastore, store) = datastore();
    (datastore.connect(BTreeMap::new()), store)
}

// ---------------------------------------------------------------
// Accessors
// ---------------------------------------------------------------

/// Append `book` to the author's book list, creating the list if needed.
pub fn add_book(author: &ObjectRef, book: &ObjectRef) {
    let books = with_object_mut::<Author, _>(author, |a| {
        a.books
            .get_or_insert_with(|| PersistentCollection::List(PersistentList::new()))
            .clone()
    })
    .expect("author");
    match books {
        PersistentCollection::List(list) => list.push(Arc::clone(book)).expect("push"),
        PersistentCollection::Set(set) => {
            set.insert(Arc::clone(book)).expect("insert");
        }
    }
    with_object_mut::<Book, _>(book, |b| b.author = Some(Arc::clone(author))).expect("book");
}

pub fn author_id(author: &ObjectRef) -> Option<i64> {
    with_object::<Author, _>(author, |a| a.id).flatten()
}

pub fn author_name(author: &ObjectRef) -> String {
    with_object::<Author, _>(author, |a| a.name.clone()).unwrap_or_default()
}

pub fn author_books(author: &ObjectRef) -> Option<PersistentCollection> {
    with_object::<Author, _>(author, |a| a.books.clone()).flatten()
}

pub fn book_id(book: &ObjectRef) -> Option<i64> {
    with_object::<Book, _>(book, |b| b.id).flatten()
}

pub fn book_title(book: &ObjectRef) -> String {
    with_object::<Book, _>(book, |b| b.title.clone()).unwrap_or_default()
}

pub fn book_author(book: &ObjectRef) -> Option<ObjectRef> {
    with_object::<Book, _>(book, |b| b.author.clone()).flatten()
}
