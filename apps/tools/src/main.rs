use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use shared::domain::{ConversationKind, ParticipantRole, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        display_name: String,
        #[arg(long, default_value = "member")]
        role: String,
    },
    /// The first participant owns the conversation.
    CreateConversation {
        kind: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(required = true)]
        participants: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser { display_name, role } => {
            let user_id = storage.create_user(&display_name, &role).await?;
            println!("created user_id={}", user_id.0);
        }
        Command::CreateConversation {
            kind,
            name,
            participants,
        } => {
            let Some(kind) = ConversationKind::parse(&kind) else {
                bail!("conversation kind must be direct or group, got {kind}");
            };
            let participants: Vec<(UserId, ParticipantRole)> = participants
                .into_iter()
                .enumerate()
                .map(|(index, user_id)| {
                    let role = if index == 0 {
                        ParticipantRole::Owner
                    } else {
                        ParticipantRole::Member
                    };
                    (UserId(user_id), role)
                })
                .collect();
            let conversation_id = storage
                .create_conversation(kind, name.as_deref(), &participants)
                .await?;
            println!("created conversation_id={}", conversation_id.0);
        }
    }

    Ok(())
}
