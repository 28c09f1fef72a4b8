use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use draftcache::cache::{Cacheable, ClientId, EntityKind};
use draftcache::config::Config;
use draftcache::domain::{AnyEntity, Prompt};
use draftcache::{logging, Session};

#[derive(Parser, Debug)]
#[command(name = "draftcache")]
#[command(about = "Offline-first cache for prompts and profiles")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/draftcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show cached and pending counts per kind
  Status,
  /// Work with prompts locally; changes are queued until the next sync
  #[command(subcommand)]
  Prompt(PromptCommand),
  /// Replay queued changes, then pull what changed on the server
  Sync,
  /// Drop everything cached on this machine
  SignOut,
}

#[derive(Subcommand, Debug)]
enum PromptCommand {
  /// List cached prompts, most recently edited first
  List,
  New {
    #[arg(long)]
    title: String,
    #[arg(long)]
    body: Option<String>,
  },
  Edit {
    id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    body: Option<String>,
  },
  Delete {
    id: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let mut session = Session::open(&config)?;

  match args.command {
    Command::Status => print_status(&session),
    Command::Prompt(cmd) => run_prompt(&mut session, cmd)?,
    Command::Sync => {
      // Without credentials every unit would come back unauthorized and be dropped
      Config::get_api_token()?;
      let report = session.reconnect().await?;
      println!(
        "confirmed {}, deleted {}, unconfirmed {}, dropped {}, identity retries {}",
        report.confirmed, report.deleted, report.unconfirmed, report.dropped, report.collisions
      );
      if let Some(reason) = report.stalled {
        println!("{} change(s) still queued: {}", session.queue().len(), reason);
      }
      print_status(&session);
      return Ok(());
    }
    Command::SignOut => {
      session.sign_out()?;
      println!("Signed out.");
      return Ok(());
    }
  }

  session.persist()
}

fn run_prompt(session: &mut Session, cmd: PromptCommand) -> Result<()> {
  match cmd {
    PromptCommand::List => {
      for entity in session.manager().ranked(EntityKind::Prompt) {
        if let AnyEntity::Prompt(p) = entity {
          let marker = if p.is_dirty() { "*" } else { " " };
          println!("{} {}  {}", marker, p.client_id(), p.title());
        }
      }
    }
    PromptCommand::New { title, body } => {
      let id = session.create(Prompt {
        title,
        body: body.unwrap_or_default(),
        ..Prompt::default()
      });
      println!("{}", id);
    }
    PromptCommand::Edit { id, title, body } => {
      if title.is_none() && body.is_none() {
        return Err(eyre!("Nothing to change: pass --title and/or --body"));
      }
      session.edit::<Prompt, _>(&ClientId::from(id), |p| {
        if let Some(title) = title {
          p.set_title(title);
        }
        if let Some(body) = body {
          p.set_body(body);
        }
      })?;
    }
    PromptCommand::Delete { id } => session.delete_prompt(&ClientId::from(id))?,
  }
  Ok(())
}

fn print_status(session: &Session) {
  for status in session.status() {
    println!(
      "{:<8} tracked {:>4}  dirty {:>4}  queued {:>4}",
      status.kind.name(), status.tracked, status.dirty, status.pending
    );
    if let Some(error) = status.error {
      println!("         error: {}", error);
    }
  }
}
