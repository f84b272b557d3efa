//! Arcol document tools.
//!
//! Usage:
//!   # Write an empty document (one root level)
//!   arcol new doc.json
//!
//!   # Load a storage snapshot and print its element tree
//!   arcol inspect doc.json
//!   arcol inspect doc.json --flat
//!
//!   # Two in-process clients editing one document
//!   arcol demo
//!
//! Every command takes `--config <file.ron>`. `RUST_LOG` overrides the
//! configured log filter.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Context, Result};
use arcol_live::{Room, RoomSnapshot};
use arcol_model::{initial_storage, Editor, EditorConfig, Hidable};
use arcol_types::ElementId;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "arcol")]
#[command(about = "Inspect and exercise Arcol documents")]
struct Args {
    /// Editor config (RON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write storage for a new, empty document
    New {
        path: PathBuf,
    },
    /// Load a storage snapshot and print its elements
    Inspect {
        path: PathBuf,

        /// One record per element instead of a nested tree
        #[arg(long)]
        flat: bool,
    },
    /// Run two clients against one document and print where they end up
    Demo,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EditorConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EditorConfig::default(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Command::New { path } => new_document(&path, &config),
        Command::Inspect { path, flat } => inspect(&path, config, flat),
        Command::Demo => demo(config),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn new_document(path: &Path, config: &EditorConfig) -> Result<()> {
    let level = ElementId::new();
    let snapshot = initial_storage(&config.elements_collection, level);
    let json = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), level = %level, "document created");
    Ok(())
}

fn inspect(path: &Path, config: EditorConfig, flat: bool) -> Result<()> {
    let source =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let snapshot: RoomSnapshot =
        serde_json::from_str(&source).with_context(|| format!("parsing {}", path.display()))?;

    let editor = Editor::open(Room::from_snapshot(&snapshot), config)
        .with_context(|| format!("opening {}", path.display()))?;
    info!(
        elements = editor.project().len(),
        relations = editor.relations().len(),
        "document loaded"
    );

    if flat {
        print_json(&Value::Array(editor.project().debug_objects()))
    } else {
        print_json(&editor.project().debug_tree())
    }
}

// ============================================================================
// Demo
// ============================================================================

struct Client {
    name: &'static str,
    room: Room,
    editor: Rc<Editor>,
}

impl Client {
    fn join(name: &'static str, snapshot: &RoomSnapshot, config: &EditorConfig) -> Result<Self> {
        let room = Room::from_snapshot(snapshot);
        let editor = Editor::open(room.clone(), config.clone())
            .with_context(|| format!("opening document for {name}"))?;
        Ok(Self { name, room, editor })
    }

    /// Ship this client's pending writes to `peer`.
    fn send_to(&self, peer: &Client) {
        let batches = self.room.take_outbox();
        let ops: usize = batches.iter().map(Vec::len).sum();
        for batch in &batches {
            peer.room.receive(batch);
        }
        info!(from = self.name, to = peer.name, batches = batches.len(), ops, "synced");
    }
}

fn demo(config: EditorConfig) -> Result<()> {
    let snapshot = initial_storage(&config.elements_collection, ElementId::new());
    let alice = Client::join("alice", &snapshot, &config)?;
    let bob = Client::join("bob", &snapshot, &config)?;

    // Alice draws two sketches and extrudes the first.
    let project = alice.editor.project();
    let (first, second, extrusion) = alice.editor.make_changes(|tx| -> Result<_> {
        let first = project.create_sketch(tx)?;
        let second = project.create_sketch(tx)?;
        let extrusion = project.create_extrusion(tx, &first)?;
        extrusion.set_height(tx, 3.0);
        alice.editor.relations().add_element_relation(tx, &first, &second)?;
        Ok((first, second, extrusion))
    })?;
    alice.editor.commit();
    alice.send_to(&bob);

    // Bob moves the second sketch to the front, recolors it, and hides it
    // locally.
    let theirs = bob
        .editor
        .project()
        .get_by_id(&second.id())
        .and_then(|e| e.as_sketch())
        .context("second sketch did not reach bob")?;
    let root = bob.editor.project().root_level().clone();
    bob.editor.make_changes(|tx| {
        theirs.move_to_parent_at_index(tx, &root, 0);
        theirs.set_color(tx, "#cc3333");
        theirs.set_hidden(tx, true);
    });
    bob.editor.commit();
    bob.send_to(&alice);
    info!(color = %second.color(), hidden = second.hidden(), "alice sees bob's edit");

    // Alice changes the height; Bob overwrites it; Alice undoes hers.
    alice.editor.make_changes(|tx| extrusion.set_height(tx, 5.0));
    alice.editor.commit();
    alice.send_to(&bob);
    if let Some(theirs) = bob
        .editor
        .project()
        .get_by_id(&extrusion.id())
        .and_then(|e| e.as_extrusion())
    {
        bob.editor.make_changes(|tx| theirs.set_height(tx, 9.0));
    }
    bob.send_to(&alice);
    alice.editor.undo();
    alice.send_to(&bob);
    info!(height = extrusion.height(), "after alice's undo");

    // Bob deletes the backing sketch. Both frame passes clean up the empty
    // extrusion, and the relation goes with its endpoint.
    if let Some(theirs) = bob.editor.project().get_by_id(&first.id()) {
        bob.editor.make_changes(|tx| theirs.delete(tx));
    }
    bob.send_to(&alice);
    alice.editor.on_frame();
    bob.editor.on_frame();
    alice.send_to(&bob);
    bob.send_to(&alice);

    let converged = alice.room.snapshot() == bob.room.snapshot();
    info!(
        converged,
        elements = alice.editor.project().len(),
        relations = alice.editor.relations().len(),
        "demo finished"
    );
    print_json(&alice.editor.project().debug_tree())
}
