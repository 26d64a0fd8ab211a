//! # coffer
//!
//! Command-line front end for coffer safes: manage identities, create and
//! open safes, administer groups, move files in and out, and exchange
//! messages.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use coffer_engine::{
    logging, Catalog, CatalogOptions, CommView, Engine, EngineConfig, FsView, ListOptions, Payload,
    PutOptions, Resource, Safe, SafeSettings,
};
use coffer_shared::protocol::GroupAction;
use coffer_shared::{Identity, IdentityId, Invite};

#[derive(Parser)]
#[command(name = "coffer", version, about = "Encrypted multi-user safes")]
struct Cli {
    /// Catalog file; `COFFER_CATALOG` or the platform default when omitted.
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage local identities.
    #[command(subcommand)]
    Identity(IdentityCommand),
    /// Create, open and list safes.
    #[command(subcommand)]
    Safe(SafeCommand),
    /// Add users to a group with a role (1 reader, 2 writer, 3 admin).
    Grant(GroupArgs),
    /// Remove users from a group.
    Revoke(GroupArgs),
    /// Flag users of a group as distrusted.
    Curse(GroupArgs),
    /// Clear a curse and add trust.
    Endorse(GroupArgs),
    /// Show group membership.
    Groups { url: String },
    /// List files.
    Ls {
        url: String,
        #[arg(default_value = "")]
        dir: String,
        #[arg(long)]
        deleted: bool,
        #[arg(long, short)]
        recursive: bool,
    },
    /// Upload a local file.
    Put {
        url: String,
        source: PathBuf,
        dest: String,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        zip: bool,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Only this identity (and you) can read the file.
        #[arg(long)]
        private: Option<String>,
        /// Remove the local file once uploaded.
        #[arg(long = "move")]
        delete_src: bool,
    },
    /// Download a file.
    Get { url: String, src: String, dest: PathBuf },
    /// Delete a file.
    Rm { url: String, path: String },
    /// Rename a file.
    Mv { url: String, old: String, new: String },
    /// Send a message to an identity or broadcast it to a group.
    Say {
        url: String,
        #[arg(long, conflicts_with = "group", required_unless_present = "group")]
        to: Option<String>,
        #[arg(long)]
        group: Option<String>,
        text: String,
    },
    /// Print new messages.
    Listen {
        url: String,
        /// Sender id or group name.
        #[arg(default_value = "")]
        filter: String,
    },
    /// Print an invite link for a group of a safe.
    Invite {
        url: String,
        group: String,
        #[arg(long, default_value = "https://coffer.invalid")]
        base: String,
    },
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Create an identity and make it current.
    New { nick: String },
    /// Show the current identity.
    Show {
        /// Also print the private material.
        #[arg(long)]
        private: bool,
    },
    /// Switch the current identity.
    Use { id: String },
}

#[derive(Subcommand)]
enum SafeCommand {
    Create {
        url: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Zero means unlimited.
        #[arg(long, default_value_t = 0)]
        quota: u64,
    },
    Open { url: String },
    List,
}

#[derive(Args)]
struct GroupArgs {
    url: String,
    group: String,
    user: String,
    /// Role for grant, weight for curse and endorse.
    #[arg(default_value_t = 1)]
    value: i64,
}

struct Session {
    engine: &'static Engine,
    catalog: Arc<Catalog>,
}

impl Session {
    fn start(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let engine = Engine::install(EngineConfig::from_env());
        let handle = match path {
            Some(path) => {
                let options = CatalogOptions {
                    force_create: true,
                    ..Default::default()
                };
                let catalog = Catalog::open(&path, options)
                    .with_context(|| format!("opening catalog {}", path.display()))?;
                engine.registry().insert(Resource::Catalog(Arc::new(catalog)), None)?
            }
            None => engine.default_catalog()?,
        };
        let catalog = engine.registry().catalog(handle)?;
        tracing::debug!(catalog = %catalog.path().display(), "session started");
        Ok(Self { engine, catalog })
    }

    fn identity(&self) -> anyhow::Result<Identity> {
        let id = self
            .catalog
            .current_identity()?
            .context("no current identity, run `coffer identity new <nick>` first")?;
        Ok(self.catalog.load_identity(&id)?)
    }

    fn open(&self, url: &str) -> anyhow::Result<Arc<Safe>> {
        let identity = self.identity()?;
        let safe = Safe::open(self.catalog.clone(), &identity, url, self.engine.config().clone())
            .with_context(|| format!("opening {url}"))?;
        Ok(Arc::new(safe))
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn update_group(session: &Session, args: GroupArgs, action: GroupAction) -> anyhow::Result<()> {
    let safe = session.open(&args.url)?;
    let user = IdentityId(args.user);
    safe.update_group(&args.group, action, &[(user.clone(), args.value)])?;
    println!("{action:?} {} in {}", user.short(), args.group);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    logging::install_from_env("info,coffer_engine=debug");
    let cli = Cli::parse();
    let session = Session::start(cli.catalog)?;

    match cli.command {
        Command::Identity(IdentityCommand::New { nick }) => {
            let identity = Identity::create(&nick)?;
            session.catalog.save_identity(&identity)?;
            session.catalog.set_current_identity(identity.id())?;
            println!("{}", identity.id());
        }
        Command::Identity(IdentityCommand::Show { private }) => {
            let identity = session.identity()?;
            println!("{}", identity.id());
            if private {
                println!("{}", identity.private_material().unwrap_or_default());
            }
        }
        Command::Identity(IdentityCommand::Use { id }) => {
            let identity = session.catalog.load_identity(&IdentityId(id))?;
            session.catalog.set_current_identity(identity.id())?;
            println!("now using {}", identity.id().short());
        }

        Command::Safe(SafeCommand::Create {
            url,
            description,
            quota,
        }) => {
            let identity = session.identity()?;
            let settings = SafeSettings {
                description,
                quota_bytes: quota,
            };
            let safe = Safe::create(
                session.catalog.clone(),
                &identity,
                &url,
                &settings,
                session.engine.config().clone(),
            )?;
            print_json(&safe.config())?;
        }
        Command::Safe(SafeCommand::Open { url }) => print_json(&session.open(&url)?.config())?,
        Command::Safe(SafeCommand::List) => {
            for safe in session.catalog.list_safes()? {
                println!("{}\t{}", safe.url, safe.description);
            }
        }

        Command::Grant(args) => update_group(&session, args, GroupAction::Grant)?,
        Command::Revoke(args) => update_group(&session, args, GroupAction::Revoke)?,
        Command::Curse(args) => update_group(&session, args, GroupAction::Curse)?,
        Command::Endorse(args) => update_group(&session, args, GroupAction::Endorse)?,
        Command::Groups { url } => print_json(&session.open(&url)?.groups()?)?,

        Command::Ls {
            url,
            dir,
            deleted,
            recursive,
        } => {
            let fs = FsView::new(session.open(&url)?);
            let options = ListOptions {
                include_deleted: deleted,
                depth: if recursive { -1 } else { 0 },
                ..Default::default()
            };
            for entry in fs.list(&dir, &options)? {
                let mark = if entry.deleted { " (deleted)" } else { "" };
                println!("{:>10}  {}  {}{mark}", entry.size, entry.modified_at.format("%F %R"), entry.path);
            }
        }
        Command::Put {
            url,
            source,
            dest,
            group,
            zip,
            tags,
            private,
            delete_src,
        } => {
            let fs = FsView::new(session.open(&url)?);
            let options = PutOptions {
                group,
                zip,
                tags,
                private: private.map(IdentityId),
                delete_src,
                ..Default::default()
            };
            let entry = fs.put_file(&dest, &source, &options)?;
            println!("{} ({} bytes)", entry.path, entry.size);
        }
        Command::Get { url, src, dest } => {
            let fs = FsView::new(session.open(&url)?);
            let size = fs.get_file(&src, &dest, &Default::default())?;
            println!("{} bytes written to {}", size, dest.display());
        }
        Command::Rm { url, path } => {
            FsView::new(session.open(&url)?).delete(&path)?;
        }
        Command::Mv { url, old, new } => {
            let entry = FsView::new(session.open(&url)?).rename(&old, &new)?;
            println!("{}", entry.path);
        }

        Command::Say { url, to, group, text } => {
            let comm = CommView::new(session.open(&url)?);
            let payload = Payload::text(text);
            let id = match (to, group) {
                (Some(to), None) => comm.send(&IdentityId(to), &payload)?,
                (None, Some(group)) => comm.broadcast(&group, &payload)?,
                _ => bail!("give exactly one of --to or --group"),
            };
            println!("{id}");
        }
        Command::Listen { url, filter } => {
            let comm = CommView::new(session.open(&url)?);
            for message in comm.receive(&filter)? {
                let stream = message
                    .group
                    .as_ref()
                    .map(|g| format!("#{g}"))
                    .unwrap_or_else(|| "direct".to_string());
                let body = match (&message.text, &message.file_name) {
                    (Some(text), _) => text.clone(),
                    (None, Some(name)) => format!("[file {name}]"),
                    (None, None) => format!("[{} bytes]", message.data.as_ref().map_or(0, Vec::len)),
                };
                println!("{} {} {}: {body}", message.created_at.format("%F %T"), stream, message.sender.short());
            }
        }
        Command::Invite { url, group, base } => {
            let safe = session.open(&url)?;
            safe.check_member(
                &coffer_shared::GroupName::new(&group).context("invalid group name")?,
            )?;
            println!("{}", Invite::new(safe.local_key(), group, url).to_link(&base));
        }
    }

    Ok(())
}
