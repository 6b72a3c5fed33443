use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use client_core::{
    connect, load_settings, CollectionChange, HttpRemoteStore, RemoteStore, SyncEvent,
};
use shared::{
    domain::{Story, StoryId},
    protocol::StoryDraft,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `server_url` from board.toml and BOARD__SERVER_URL.
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the live board until interrupted.
    Watch,
    List,
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long)]
        position: Option<i64>,
    },
    Delete {
        #[arg(long)]
        id: StoryId,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings()?;
    if let Some(server_url) = cli.server_url.as_deref() {
        settings = settings.with_server_url(server_url)?;
    }

    match cli.command {
        Command::Watch => watch(&settings).await?,
        Command::List => {
            let remote = HttpRemoteStore::new(&settings.server_url)?;
            for story in remote.fetch_all().await?.stories {
                print_story(&story);
            }
        }
        Command::Add {
            title,
            text,
            position,
        } => {
            let remote = HttpRemoteStore::new(&settings.server_url)?;
            let story = remote
                .create_story(&StoryDraft {
                    title,
                    text,
                    position,
                })
                .await?;
            println!("created story_id={}", story.id);
        }
        Command::Delete { id } => {
            let remote = HttpRemoteStore::new(&settings.server_url)?;
            let story = remote
                .fetch_all()
                .await?
                .stories
                .into_iter()
                .find(|story| story.id == id)
                .ok_or_else(|| anyhow!("no story with id {id}"))?;
            remote.delete_story(&story).await?;
            println!("deleted story_id={id}");
        }
    }

    Ok(())
}

async fn watch(settings: &client_core::SyncSettings) -> Result<()> {
    let (mut runtime, handle) = connect(settings)?;
    runtime.subscribe(Box::new(|change: &CollectionChange, stories: &[Story]| {
        match change {
            CollectionChange::Reset => info!(stories = stories.len(), "board loaded"),
            CollectionChange::Appended { index } => {
                if let Some(story) = stories.get(*index) {
                    info!(story_id = %story.id, title = %story.title, "story added");
                }
            }
            CollectionChange::Replaced { index, previous } => {
                info!(story_id = %previous.id, index, "story refreshed");
            }
            CollectionChange::Removed { removed } => {
                for story in removed {
                    info!(story_id = %story.id, title = %story.title, "story removed");
                }
            }
        }
        for story in stories {
            print_story(story);
        }
    }));

    let mut events = handle.subscribe_events();
    let retry_ms = settings.snapshot_retry.as_millis() as u64;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SyncEvent::StateChanged(state) => info!(?state, "sync state"),
                SyncEvent::SnapshotFailed(reason) => {
                    warn!(%reason, retry_ms, "board load failed")
                }
                SyncEvent::ChannelClosed { reason } => {
                    warn!(?reason, "live updates stopped; run `board watch` again to reconnect")
                }
                other => warn!(?other, "sync problem"),
            }
        }
    });

    let runtime_task = tokio::spawn(runtime.run());
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown().await?;
    let controller = runtime_task.await?;
    info!(stories = controller.stories().len(), "board closed");
    Ok(())
}

fn print_story(story: &Story) {
    println!("{}  [{}] {}", story.id, story.position, story.title);
}
