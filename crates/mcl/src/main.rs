use clap::{Parser, Subcommand};

mod commands;
mod contact_list;
mod output;

use contact_list::ContactList;
use output::Output;

#[derive(Parser)]
#[command(name = "mcl")]
#[command(version)]
#[command(about = "Inspect and edit a stored meta contact list")]
#[command(long_about = "Opens the contact list persisted in the data directory without connecting \
any account. Local edits are written back; server side changes are not possible offline.")]
struct Cli {
    /// Output in JSON format (for scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/mcl)
    #[arg(long, global = true, env = "MCL_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the contact tree
    Show {
        /// Start at this group instead of the root
        #[arg(short, long)]
        group: Option<String>,
    },

    /// List accounts with stored contacts
    Accounts,

    /// Meta contact management
    #[command(subcommand)]
    Contact(ContactCommands),

    /// Group management
    #[command(subcommand)]
    Group(GroupCommands),

    /// Message history of a meta contact
    #[command(subcommand)]
    History(HistoryCommands),

    /// Contacts with the latest messages, newest first
    Recent {
        /// How many to show
        #[arg(short, long, default_value_t = 10)]
        count: usize,
    },

    /// Delete the stored contact list
    Purge,
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// Print the latest messages
    Show {
        /// Meta contact uid
        uid: String,
        /// How many messages
        #[arg(short, long, default_value_t = 20)]
        count: usize,
    },

    /// Delete stored messages of one meta contact, or all of them
    Erase {
        /// Meta contact uid
        uid: Option<String>,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Give a meta contact a user-defined name
    Rename {
        /// Meta contact uid
        uid: String,
        /// New display name
        name: String,
    },

    /// Forget the user-defined name of a meta contact
    ClearName {
        /// Meta contact uid
        uid: String,
    },

    /// Detail management
    #[command(subcommand)]
    Detail(DetailCommands),
}

#[derive(Subcommand)]
enum DetailCommands {
    /// Add a value to a detail
    Add {
        /// Meta contact uid
        uid: String,
        /// Detail name
        name: String,
        /// Value to add
        value: String,
    },

    /// Remove one value of a detail, or all of them
    Remove {
        /// Meta contact uid
        uid: String,
        /// Detail name
        name: String,
        /// Value to remove (all values when omitted)
        value: Option<String>,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Rename a group
    Rename {
        /// Group uid
        uid: String,
        /// New name
        name: String,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let output = Output::new(cli.json);

    if let Err(e) = run(cli, &output) {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?
            .join("mcl"),
    };
    std::fs::create_dir_all(&data_dir)?;

    let list = ContactList::open(&data_dir)?;

    match cli.command {
        Commands::Show { group } => commands::show::show(group.as_deref(), &list, output),
        Commands::Accounts => commands::show::accounts(&list, output),
        Commands::Contact(cmd) => match cmd {
            ContactCommands::Rename { uid, name } => {
                commands::contact::rename(&uid, &name, &list, output)
            }
            ContactCommands::ClearName { uid } => commands::contact::clear_name(&uid, &list, output),
            ContactCommands::Detail(DetailCommands::Add { uid, name, value }) => {
                commands::contact::add_detail(&uid, &name, &value, &list, output)
            }
            ContactCommands::Detail(DetailCommands::Remove { uid, name, value }) => {
                commands::contact::remove_detail(&uid, &name, value.as_deref(), &list, output)
            }
        },
        Commands::Group(GroupCommands::Rename { uid, name }) => {
            commands::group::rename(&uid, &name, &list, output)
        }
        Commands::History(HistoryCommands::Show { uid, count }) => {
            commands::history::show(&uid, count, &list, output)
        }
        Commands::History(HistoryCommands::Erase { uid }) => {
            commands::history::erase(uid.as_deref(), &list, output)
        }
        Commands::Recent { count } => commands::history::recent(count, &list, output),
        Commands::Purge => commands::show::purge(&list, output),
    }
}
