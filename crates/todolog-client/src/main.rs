//! `todo`: command-line client for a todolog server.
//!
//! Usage:
//!   todo list
//!   todo add "Buy milk"
//!   todo done 0199          # toggle by id prefix
//!   todo rename 0199 "Buy oat milk"
//!   todo rm 0199 01a3
//!   todo clear              # remove completed items
//!   todo watch              # print the list whenever it changes
//!
//! Every write waits until the change stream has caught up with it.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use todolog_client::{ClientConfig, Mutation, SessionEvent, SessionHandle, Snapshot};
use todolog_types::{Item, ItemChanges, ItemId, NewItem};

/// Optimistic todo list client.
#[derive(Parser, Debug)]
#[command(name = "todo")]
#[command(about = "Command-line client for a todolog server")]
struct Args {
    /// Server base URL
    #[arg(long, env = "TODOLOG_SERVER_URL", default_value = todolog_client::constants::DEFAULT_SERVER_URL)]
    server: String,

    /// Subscription endpoint override (defaults to the server's gateway)
    #[arg(long, env = "TODOLOG_SHAPE_URL")]
    shape_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every item
    List,
    /// Add an item
    Add { title: String },
    /// Flip an item's completed flag
    Done { id: String },
    /// Change an item's title
    Rename { id: String, title: String },
    /// Delete items
    Rm {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Delete every completed item
    Clear,
    /// Print the list on every change until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _tracing = todolog_telemetry::init_tracing("todo", "warn");
    let args = Args::parse();

    let mut config = ClientConfig::new(&args.server);
    if let Some(url) = args.shape_url {
        config = config.with_shape_url(url);
    }

    let session = todolog_client::connect(config).context("starting session")?;
    let snapshot = session.wait_synced().await.context("waiting for the change stream")?;

    let mutation = match args.command {
        Command::List => {
            print_items(&snapshot.items);
            return Ok(());
        }
        Command::Watch => return watch(&session).await,
        Command::Add { title } => Mutation::Create(NewItem::new(ItemId::generate(), title)),
        Command::Done { id } => Mutation::Toggle { id: resolve(&snapshot, &id)? },
        Command::Rename { id, title } => Mutation::Update {
            id: resolve(&snapshot, &id)?,
            changes: ItemChanges::title(title),
        },
        Command::Rm { ids } => Mutation::Delete {
            ids: ids.iter().map(|id| resolve(&snapshot, id)).collect::<Result<_>>()?,
        },
        Command::Clear => Mutation::ClearCompleted,
    };

    let kind = mutation.kind();
    match session.submit_and_settle(mutation).await? {
        SessionEvent::Reconciled { txid, .. } => tracing::info!(%txid, kind, "reconciled"),
        SessionEvent::NoOp { .. } => println!("nothing to do"),
        event => tracing::debug!(?event, "settled"),
    }

    print_items(&session.snapshot().await?.items);
    Ok(())
}

/// Find the single item whose id starts with `prefix`.
fn resolve(snapshot: &Snapshot, prefix: &str) -> Result<ItemId> {
    let mut matches = snapshot.items.iter().filter(|item| item.id.as_str().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(item), None) => Ok(item.id.clone()),
        (None, _) => bail!("no item matches '{prefix}'"),
        (Some(_), Some(_)) => bail!("'{prefix}' matches more than one item"),
    }
}

fn print_items(items: &[Item]) {
    if items.is_empty() {
        println!("(empty)");
        return;
    }
    for item in items {
        let mark = if item.completed { "x" } else { " " };
        println!("[{mark}] {}  {}", item.id, item.title);
    }
}

async fn watch(session: &SessionHandle) -> Result<()> {
    let mut version = session.subscribe_version();
    let mut shown = session.snapshot().await?;
    print_items(&shown.items);

    loop {
        tokio::select! {
            changed = version.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }

        let snapshot = session.snapshot().await?;
        if snapshot.items != shown.items {
            println!();
            print_items(&snapshot.items);
        }
        if snapshot.status.lagging > shown.status.lagging {
            eprintln!("sync lag: {} write(s) not yet on the stream", snapshot.status.lagging);
        }
        shown = snapshot;
    }
}
