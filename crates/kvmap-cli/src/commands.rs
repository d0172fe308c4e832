use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use kvmap_engine::{Datastore, DatastoreConfig, InMemoryBackend, InMemoryStore};
use kvmap_model::{
    object_ref, with_object, FetchStrategy, PersistentCollection, PersistentList,
};
use kvmap_types::Value;

use crate::cli::*;
use crate::domain::{self, Author, Book, AUTHOR};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Demo(args) => cmd_demo(&args),
        Command::Config(args) => match args.action {
            ConfigAction::Check { path } => cmd_config_check(&path),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

/// What the demo scenario observed.
#[derive(Debug)]
pub struct DemoReport {
    pub author_id: Value,
    pub book_ids: Vec<Value>,
    pub loaded_with_author: bool,
    pub titles: Vec<String>,
    pub found_by_name: usize,
    pub remaining_books: usize,
    pub backend_calls: usize,
}

const AUTHOR_NAME: &str = "Ursula K. Le Guin";

pub fn run_demo(args: &DemoArgs) -> anyhow::Result<DemoReport> {
    let mut config = match &args.config {
        Some(path) => DatastoreConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DatastoreConfig::default(),
    };
    if args.eager {
        config.default_fetch = FetchStrategy::Eager;
    }

    let store = InMemoryStore::new();
    let backend = Arc::new(InMemoryBackend::with_store(store.clone()));
    let context = Arc::new(domain::mapping_context()?);
    let datastore = Arc::new(Datastore::new(context, backend).with_config(config));

    // Write the graph in one session.
    let books = PersistentList::new();
    let author = object_ref(Author {
        id: None,
        name: AUTHOR_NAME.to_string(),
        books: Some(PersistentCollection::List(books.clone())),
    });
    for i in 1..=args.books {
        books.push(object_ref(Book {
            id: None,
            title: format!("Volume {i}"),
            author: Some(Arc::clone(&author)),
        }))?;
    }
    let author_id = datastore.with_session(BTreeMap::new(), |s| s.persist(&author))?;
    let book_ids = books
        .to_vec()?
        .iter()
        .map(|b| with_object::<Book, _>(b, |b| Value::from(b.id)).unwrap_or_default())
        .collect();

    // Read it back in another.
    let (loaded_with_author, titles, found_by_name) =
        datastore.with_session(BTreeMap::new(), |s| {
            let Some(loaded) = s.retrieve(AUTHOR, author_id.clone())? else {
                return Ok((false, Vec::new(), 0));
            };
            let books = with_object::<Author, _>(&loaded, |a| a.books.clone()).flatten();
            let loaded_with_author = books.as_ref().is_some_and(PersistentCollection::is_initialized);
            let titles: Vec<String> = match books {
                Some(books) => books
                    .to_vec()?
                    .iter()
                    .map(|b| with_object::<Book, _>(b, |b| b.title.clone()).unwrap_or_default())
                    .collect(),
                None => Vec::new(),
            };
            let found = s.retrieve_by_property(AUTHOR, "name", AUTHOR_NAME, 0, None)?;
            s.delete(&[loaded])?;
            Ok((loaded_with_author, titles, found.len()))
        })?;

    Ok(DemoReport {
        author_id,
        book_ids,
        loaded_with_author,
        titles,
        found_by_name,
        remaining_books: store.count("books")?,
        backend_calls: store.calls().len(),
    })
}

fn cmd_demo(args: &DemoArgs) -> anyhow::Result<()> {
    let report = run_demo(args)?;
    let ids: Vec<String> = report.book_ids.iter().map(ToString::to_string).collect();
    println!("{} Persisted author {} with {} books", "✓".green().bold(), report.author_id.to_string().yellow(), ids.len());
    println!("  Book keys: {}", ids.join(", ").cyan());
    let fetch = if report.loaded_with_author { "eager".green() } else { "lazy".yellow() };
    println!("  Collection fetch: {fetch}");
    for title in &report.titles {
        println!("  - {title}");
    }
    println!("  Found by name: {}", report.found_by_name.to_string().bold());
    println!("{} Deleted author and {} remaining books", "✓".green().bold(), report.remaining_books);
    println!("  Backend calls: {}", report.backend_calls.to_string().dimmed());
    Ok(())
}

fn print_config(config: &DatastoreConfig) {
    let fetch = match config.default_fetch {
        FetchStrategy::Eager => "eager",
        FetchStrategy::Lazy => "lazy",
    };
    println!("  default_fetch: {}", fetch.cyan());
    println!("  first_level_cache: {}", config.first_level_cache.to_string().cyan());
    for (key, value) in &config.connection {
        println!("  connection.{}: {}", key.bold(), value);
    }
}

fn cmd_config_check(path: &Path) -> anyhow::Result<()> {
    let config = DatastoreConfig::load(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    println!("{} {} is valid", "✓".green().bold(), path.display().to_string().bold());
    print_config(&config);
    Ok(())
}

fn cmd_config_show() -> anyhow::Result<()> {
    print!("{}", DatastoreConfig::default().to_toml_string()?);
    Ok(())
}
