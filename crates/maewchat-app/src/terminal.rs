//! Line-oriented terminal front-end over the view controllers.

use std::sync::Arc;

use chrono::Local;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use maewchat_client::{AuthBackend, ChatBackend};
use maewchat_types::models::{Conversation, Message, User};

use crate::conversations::ConversationList;
use crate::notice::{Notice, NoticeLevel, Notices};
use crate::session::SessionController;
use crate::thread::{MessageThread, ThreadView};

const WIDTH: usize = 72;

const HELP: &str = "\
Commands:
  /login <email>          send a magic link
  /verify <email> <code>  sign in with the code from the email
  /link <url>             sign in with the URL the magic link opened
  /logout                 sign out
  /list                   show conversations
  /new <user-id>          start a conversation
  /open <n>               open conversation n from /list
  /quit                   exit
Anything else is sent to the open conversation.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(String),
    Verify(String, String),
    Link(String),
    Logout,
    List,
    New(String),
    Open(usize),
    Help,
    Quit,
    Send(String),
    Invalid(String),
}

/// `None` for a blank line.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Some(Command::Send(line.trim_end_matches(['\r', '\n']).to_string()));
    };

    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();
    let command = match (name, args.as_slice()) {
        ("login", [email]) => Command::Login(email.to_string()),
        ("login", []) => Command::Login(String::new()),
        ("verify", [email, code]) => Command::Verify(email.to_string(), code.to_string()),
        ("link", [url]) => Command::Link(url.to_string()),
        ("logout", []) => Command::Logout,
        ("list", []) => Command::List,
        ("new", [id]) => Command::New(id.to_string()),
        ("new", []) => Command::New(String::new()),
        ("open", [n]) => match n.parse::<usize>() {
            Ok(n) if n > 0 => Command::Open(n),
            _ => Command::Invalid(format!("Not a conversation number: {n}")),
        },
        ("help", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        _ => Command::Invalid(format!("Unknown command: /{rest}")),
    };
    Some(command)
}

pub fn format_message(message: &Message, mine: bool) -> String {
    let time = message
        .created_at
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S");
    let line = format!("{}  [{}]", message.content, time);
    if mine {
        format!("{line:>WIDTH$}")
    } else {
        line
    }
}

fn format_notice(notice: &Notice) -> String {
    match notice.level {
        NoticeLevel::Info => format!("* {}", notice.text),
        NoticeLevel::Error => format!("! {}", notice.text),
    }
}

fn print_conversations(me: &User, list: &[Conversation], selected: Option<Uuid>) {
    println!("-- Conversations --");
    if list.is_empty() {
        println!("   (none yet, start one with /new <user-id>)");
    }
    for (i, conversation) in list.iter().enumerate() {
        let marker = if Some(conversation.id) == selected { '>' } else { ' ' };
        println!(
            "{marker}{:>2}. {} with {}",
            i + 1,
            conversation.id,
            conversation.peer_of(me.id)
        );
    }
}

async fn render_conversations(
    me: User,
    mut list: watch::Receiver<Vec<Conversation>>,
    mut thread: watch::Receiver<ThreadView>,
) {
    let mut selected = thread.borrow_and_update().conversation.as_ref().map(|c| c.id);
    print_conversations(&me, &list.borrow_and_update(), selected);
    loop {
        tokio::select! {
            changed = list.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = thread.changed() => {
                if changed.is_err() {
                    break;
                }
                // Only a selection change affects this pane.
                let now = thread.borrow_and_update().conversation.as_ref().map(|c| c.id);
                if now == selected {
                    continue;
                }
                selected = now;
            }
        }
        print_conversations(&me, &list.borrow_and_update(), selected);
    }
}

async fn render_thread(me: User, mut thread: watch::Receiver<ThreadView>) {
    let mut shown: Option<Uuid> = None;
    let mut printed = 0;
    let mut announced_loading = false;
    loop {
        {
            let view = thread.borrow_and_update();
            let current = view.conversation.as_ref().map(|c| c.id);
            if current != shown || view.messages.len() < printed {
                shown = current;
                printed = 0;
                announced_loading = false;
                if let Some(conversation) = &view.conversation {
                    println!("== Conversation {} ==", conversation.id);
                }
            }
            if view.loading && view.conversation.is_some() && !announced_loading {
                println!("   loading...");
                announced_loading = true;
            }
            // Print through the scroll anchor, i.e. the newest message.
            for message in &view.messages[printed..] {
                println!("{}", format_message(message, message.sender_id == me.id));
            }
            printed = view.messages.len();
        }
        if thread.changed().await.is_err() {
            break;
        }
    }
}

/// Views that exist while someone is signed in.
struct ChatViews<B: ChatBackend> {
    user: User,
    list: ConversationList<B>,
    thread: MessageThread<B>,
    renderers: Vec<JoinHandle<()>>,
}

impl<B: ChatBackend> ChatViews<B> {
    async fn open(backend: Arc<B>, user: User, notices: &Notices) -> Self {
        let list = ConversationList::open(backend.clone(), user.clone(), notices.clone()).await;
        let thread = MessageThread::new(backend, user.clone(), notices.clone());
        let renderers = vec![
            tokio::spawn(render_conversations(user.clone(), list.watch(), thread.watch())),
            tokio::spawn(render_thread(user.clone(), thread.watch())),
        ];
        Self { user, list, thread, renderers }
    }

    async fn close(self) {
        for renderer in &self.renderers {
            renderer.abort();
        }
        self.thread.close().await;
        self.list.close().await;
    }
}

/// Run the front-end until `/quit` or end of input.
pub async fn run<B>(backend: Arc<B>) -> anyhow::Result<()>
where
    B: AuthBackend + ChatBackend,
{
    let (notices, mut notice_rx) = Notices::channel();
    let mut session = SessionController::new(backend.clone(), notices.clone());
    session.start().await;
    let mut identity = session.watch();

    println!("{HELP}");
    let mut chat: Option<ChatViews<B>> = None;
    let initial = identity.borrow_and_update().clone();
    sync_identity(&backend, &notices, &mut chat, initial).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let Some(command) = parse_command(&line) else { continue };
                if command == Command::Quit {
                    break;
                }
                execute(command, &session, chat.as_mut(), &notices).await;
            }
            changed = identity.changed() => {
                if changed.is_err() {
                    break;
                }
                let user = identity.borrow_and_update().clone();
                sync_identity(&backend, &notices, &mut chat, user).await;
            }
            Some(notice) = notice_rx.recv() => println!("{}", format_notice(&notice)),
        }
    }

    if let Some(views) = chat.take() {
        views.close().await;
    }
    session.stop();
    Ok(())
}

/// Rebuild the chat views when the signed-in identity changes.
async fn sync_identity<B: ChatBackend>(
    backend: &Arc<B>,
    notices: &Notices,
    chat: &mut Option<ChatViews<B>>,
    user: Option<User>,
) {
    let current = chat.as_ref().map(|c| c.user.id);
    if current == user.as_ref().map(|u| u.id) {
        return;
    }
    if let Some(views) = chat.take() {
        views.close().await;
    }
    match user {
        Some(user) => {
            info!("Signed in as {}", user.id);
            println!("Signed in: {} ({})", user.display_name(), user.id);
            *chat = Some(ChatViews::open(backend.clone(), user, notices).await);
        }
        None => println!("Signed out. Use /login <email> to sign in."),
    }
}

async fn execute<B>(
    command: Command,
    session: &SessionController<B>,
    chat: Option<&mut ChatViews<B>>,
    notices: &Notices,
) where
    B: AuthBackend + ChatBackend,
{
    // Failures have already been turned into notices by the controllers.
    match command {
        Command::Login(email) => {
            let _ = session.request_magic_link(&email).await;
        }
        Command::Verify(email, code) => {
            let _ = session.verify_code(&email, &code).await;
        }
        Command::Link(url) => {
            let _ = session.complete_link(&url).await;
        }
        Command::Logout => {
            let _ = session.sign_out().await;
        }
        Command::Help => println!("{HELP}"),
        Command::Invalid(text) => notices.error(text),
        Command::Quit => {}
        Command::List | Command::New(_) | Command::Open(_) | Command::Send(_) => {
            let Some(chat) = chat else {
                notices.error("Sign in first");
                return;
            };
            match command {
                Command::List => {
                    let selected = chat.thread.view().conversation.map(|c| c.id);
                    print_conversations(&chat.user, &chat.list.conversations(), selected);
                }
                Command::New(id) => {
                    let _ = chat.list.create(&id).await;
                }
                Command::Open(n) => match chat.list.conversations().get(n - 1) {
                    Some(conversation) => chat.thread.select(conversation.clone()),
                    None => notices.error(format!("No conversation {n}")),
                },
                Command::Send(text) => {
                    let _ = chat.thread.send(&text).await;
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, user};

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("   "), None);
        assert_eq!(
            parse_command("/login you@example.com"),
            Some(Command::Login("you@example.com".into()))
        );
        assert_eq!(
            parse_command("/verify you@example.com 123456"),
            Some(Command::Verify("you@example.com".into(), "123456".into()))
        );
        assert_eq!(parse_command("/open 2"), Some(Command::Open(2)));
        assert!(matches!(parse_command("/open 0"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("/frobnicate"), Some(Command::Invalid(_))));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
    }

    #[test]
    fn plain_text_is_sent_as_typed() {
        assert_eq!(
            parse_command("  hello there  \n"),
            Some(Command::Send("  hello there  ".into()))
        );
    }

    #[test]
    fn own_messages_are_right_aligned() {
        let me = user("me@example.com");
        let msg = message(Uuid::new_v4(), me.id, "hi", 0);
        let mine = format_message(&msg, true);
        let theirs = format_message(&msg, false);
        assert_eq!(mine.len(), WIDTH);
        assert!(mine.starts_with(' '));
        assert!(theirs.starts_with("hi"));
    }
}
