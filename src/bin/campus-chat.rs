use std::error::Error;

use clap::Parser;
use sha2::{Digest, Sha256};

use campus_chat::config::{Cli, Command, Config};
use campus_chat::logging;
use campus_chat::media::{LocalMediaStore, UploadFile};
use campus_chat::model::{now_millis, AttachmentKind, DeliveryStatus, LegacyMessage, Viewer};
use campus_chat::session::ChatSession;
use campus_chat::storage::Storage;

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(error) = run(Cli::parse()).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = Config::from_cli_and_env(&cli)?;
    std::fs::create_dir_all(&config.data_dir)?;
    if !config.user_from_file && config.remember_user()? {
        eprintln!("saved {} as the default user", config.user_id);
    }

    let storage = Storage::open(&config.db_path())?;
    let viewer = Viewer::new(config.user_id.clone(), config.display_name.clone());
    let mut session = ChatSession::new(storage, viewer);

    match cli.command {
        Command::Start { other, title } => {
            let title = if title.is_empty() { other.clone() } else { title };
            let conversation = session.start_direct_conversation(&other, &title)?;
            println!("{}", conversation.id);
        }
        Command::Broadcast {
            title,
            participants,
        } => {
            let conversation = session.create_broadcast_conversation(&title, &participants)?;
            println!("{}", conversation.id);
        }
        Command::List { filter } => {
            session.watch_conversation_list()?;
            session.pump();
            for row in session.conversation_list(&filter) {
                let badge = row
                    .unread_badge
                    .map(|n| format!(" ({n})"))
                    .unwrap_or_default();
                println!(
                    "{}  {}{}  {}",
                    row.conversation_id,
                    row.title,
                    badge,
                    row.preview.unwrap_or_default()
                );
            }
        }
        Command::Show { conversation_id } => {
            show(&mut session, &conversation_id)?;
        }
        Command::Send {
            conversation_id,
            body,
            image,
            file,
        } => {
            let attachment = match (image, file) {
                (Some(path), _) => {
                    let upload = UploadFile::from_path(&path).await?;
                    if upload.kind() != AttachmentKind::Image {
                        return Err(format!("{} is not an image", path.display()).into());
                    }
                    Some(upload)
                }
                (None, Some(path)) => Some(UploadFile::from_path(&path).await?),
                (None, None) => None,
            };
            let uploader = LocalMediaStore::new(config.media_dir());
            let id = session
                .send_message(&conversation_id, &body, attachment, &uploader)
                .await?;
            println!("{id}");
        }
        Command::Block { conversation_id } => {
            let state = session.toggle_block(&conversation_id)?;
            println!("{}", if state.is_blocked { "blocked" } else { "unblocked" });
        }
        Command::Delete { conversation_id } => {
            session.delete_conversation(&conversation_id)?;
            println!("deleted {conversation_id}");
        }
        Command::Online => session.go_online()?,
        Command::Offline => session.go_offline()?,
        Command::ImportLegacy => {
            let report = session.store_mut().import_all_legacy()?;
            if report.is_empty() {
                println!("nothing to import");
            } else {
                println!(
                    "imported {} message(s) from {} conversation(s), {} already present",
                    report.imported, report.conversations, report.skipped
                );
            }
        }
        Command::SeedLegacy {
            conversation_id,
            body,
            without_id,
        } => {
            let timestamp = now_millis();
            let id = (!without_id).then(|| legacy_id(&conversation_id, timestamp, &body));
            let viewer = session.viewer().clone();
            session.store_mut().append_legacy_message(
                &conversation_id,
                &LegacyMessage {
                    id,
                    sender_id: viewer.user_id,
                    sender_name: viewer.display_name,
                    body: Some(body),
                    attachment: None,
                    timestamp,
                    status: DeliveryStatus::Sent,
                },
            )?;
        }
    }
    Ok(())
}

fn show(session: &mut ChatSession<Storage>, conversation_id: &str) -> Result<(), Box<dyn Error>> {
    session.open_conversation(conversation_id)?;
    // Initial snapshots, then the echoes of our own read receipts.
    while session.pump() > 0 {}

    let Some(conversation) = session.active_conversation() else {
        return Err(format!("unknown conversation: {conversation_id}").into());
    };
    println!("{} [{}]", conversation.title, conversation.kind.as_str());

    let now = now_millis();
    if let Some(presence) = session.presence(now) {
        println!("presence: {presence}");
    }
    if let (Some(state), Some(affordance)) = (session.block_state(), session.block_affordance()) {
        let holder = if state.blocked_by_me {
            " (by you)"
        } else if state.blocked_by_other {
            " (by them)"
        } else {
            ""
        };
        println!(
            "blocked: {}{}; action: {:?}{}",
            state.is_blocked,
            holder,
            affordance.action,
            if affordance.enabled { "" } else { " (disabled)" }
        );
    }
    let typing = session.typing_others();
    if !typing.is_empty() {
        println!("typing: {}", typing.join(", "));
    }

    let viewer_id = session.viewer().user_id.clone();
    for message in session.timeline() {
        let mark = match (message.sender_id == viewer_id, message.status) {
            (true, DeliveryStatus::Read) => " [read]",
            (true, DeliveryStatus::Sent) => " [sent]",
            (false, _) => "",
        };
        let attachment = message
            .attachment
            .as_ref()
            .map(|a| format!(" <{}: {}>", a.kind.as_str(), a.url))
            .unwrap_or_default();
        println!(
            "{}  {}: {}{}{}",
            logging::format_millis(message.timestamp),
            message.sender_name,
            message.body.as_deref().unwrap_or_default(),
            attachment,
            mark
        );
    }
    Ok(())
}

fn legacy_id(conversation_id: &str, timestamp: u64, body: &str) -> String {
    let digest = Sha256::new()
        .chain_update(conversation_id.as_bytes())
        .chain_update(timestamp.to_be_bytes())
        .chain_update(body.as_bytes())
        .finalize();
    hex::encode(&digest[..8])
}
