//! Swarmchat CLI
//!
//! Thin wrapper around swarmchat-core for inspecting the protocol and
//! running a session from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # Print the contact topic a peer listens on
//! swarmchat contact-topic <key>
//!
//! # Run an envelope through the codec
//! swarmchat decode '{"nonce":"01","payload":{"type":"TOPIC_TYPING","payload":{"typing":true}}}'
//!
//! # Contact handshake and a channel between three loopback peers
//! swarmchat demo
//!
//! # Start an iroh-backed node and ask another node to become a contact
//! swarmchat node --name alice --request <key> --address <address>
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use swarmchat_core::protocol::Decoded;
use swarmchat_core::{
    contact_topic_name, init_logging, ContactState, Conversation, EnvelopeCodec, IrohTransport,
    MemoryNetwork, MemoryStore, MemoryTransport, Message, MessageSource, PeerKey, Profile,
    ProtocolEvent, SessionConfig, SessionEvent, SessionManager, TopicId, Transport,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// How long each demo step may take before the demo gives up
const DEMO_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Swarmchat - encrypted chat over topic-addressed pub/sub
#[derive(Parser)]
#[command(name = "swarmchat")]
#[command(version = "0.1.0")]
#[command(about = "Swarmchat - encrypted chat over topic-addressed pub/sub")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Session configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSONL logs into this directory
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the contact topic derived from a peer key
    ContactTopic {
        /// Peer key (64 hex characters)
        key: String,
    },

    /// Decode a JSON envelope and print the event it carries
    Decode {
        /// The envelope, e.g. '{"nonce":"..","payload":{"type":"..","payload":{..}}}'
        envelope: String,
    },

    /// Run a contact handshake and a channel over the loopback network
    Demo,

    /// Start an iroh-backed node and log session activity until Ctrl-C
    Node {
        /// Display name announced to peers
        #[arg(short, long)]
        name: Option<String>,

        /// Send a contact request to this peer key on startup
        #[arg(long)]
        request: Option<String>,

        /// Routing address of the peer named by --request
        #[arg(long, requires = "request")]
        address: Option<String>,

        /// Accept every inbound contact request
        #[arg(long)]
        auto_accept: bool,
    },
}

fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Load the configuration and apply command-line overrides.
///
/// Without a config file the console stays at `warn` unless `-v` is given;
/// with one, its filter is kept unless `-v` is given.
fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if cli.verbose > 0 || cli.config.is_none() {
        config.logging.filter = verbosity_filter(cli.verbose).to_string();
    }
    if let Some(dir) = &cli.logs_dir {
        config.logging.logs_dir = Some(dir.clone());
    }
    Ok(config)
}

fn parse_key(s: &str) -> Result<PeerKey> {
    PeerKey::from_hex(s.trim()).with_context(|| format!("Invalid peer key: {}", s))
}

fn message_text(message: &Message) -> String {
    let text: Vec<&str> = message
        .blocks
        .iter()
        .filter_map(|b| b.text.as_deref())
        .collect();
    text.join(" ")
}

fn display_name<T: Transport>(manager: &SessionManager<T>, key: &PeerKey) -> String {
    if *key == manager.public_key() {
        return "me".to_string();
    }
    manager
        .contact(key)
        .ok()
        .flatten()
        .and_then(|c| c.profile.name)
        .unwrap_or_else(|| key.short())
}

fn message_line<T: Transport>(manager: &SessionManager<T>, message: &Message) -> String {
    let who = match (message.source, &message.sender) {
        (MessageSource::System, _) | (_, None) => "*".to_string(),
        (MessageSource::User, Some(key)) => display_name(manager, key),
    };
    format!("{}: {}", who, message_text(message))
}

fn conversation_title(convo: &Conversation) -> String {
    match &convo.subject {
        Some(subject) => format!("#{} ({})", subject, convo.id.short()),
        None => format!("direct ({})", convo.id.short()),
    }
}

fn print_state<T: Transport>(label: &str, manager: &SessionManager<T>) -> Result<()> {
    println!("{} ({})", label, manager.public_key().short());

    let contacts = manager.contacts()?;
    println!("  Contacts ({}):", contacts.len());
    for contact in contacts {
        println!(
            "    {} {:?}",
            display_name(manager, &contact.key()),
            contact.state
        );
    }

    let conversations = manager.conversations()?;
    println!("  Conversations ({}):", conversations.len());
    for convo in conversations {
        println!(
            "    {} - {} message(s), {} unread",
            conversation_title(&convo),
            convo.messages().len(),
            convo.unread()
        );
        for message in convo.messages() {
            println!("      {}", message_line(manager, message));
        }
    }
    println!();
    Ok(())
}

fn describe_event<T: Transport>(manager: &SessionManager<T>, event: &SessionEvent) -> String {
    match event {
        SessionEvent::ContactRequestReceived(request) => format!(
            "Contact request from {} ({})",
            request.profile.name.as_deref().unwrap_or("unnamed"),
            request.key()
        ),
        SessionEvent::ContactUpdated(contact) => format!(
            "Contact {} is now {:?}",
            display_name(manager, &contact.key()),
            contact.state
        ),
        SessionEvent::ConversationJoined { id, kind } => {
            format!("Joined {:?} conversation {}", kind, id.short())
        }
        SessionEvent::MessageAdded { convo, message, .. } => {
            format!("[{}] {}", convo.short(), message_line(manager, message))
        }
        SessionEvent::TypingChanged { convo, peer, typing } => format!(
            "[{}] {} {}",
            convo.short(),
            display_name(manager, peer),
            if *typing { "is typing" } else { "stopped typing" }
        ),
        SessionEvent::ActionUpdated(action) => {
            format!("Action {} is {:?}", action.id, action.state())
        }
        SessionEvent::ConversationLeft(id) => format!("Left conversation {}", id.short()),
    }
}

/// Poll `check` until it holds or the demo step times out
async fn wait_until(what: &str, mut check: impl FnMut() -> Result<bool>) -> Result<()> {
    let deadline = tokio::time::Instant::now() + DEMO_STEP_TIMEOUT;
    loop {
        if check()? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn demo_node(
    network: &MemoryNetwork,
    config: &SessionConfig,
    name: &str,
) -> Result<SessionManager<MemoryTransport>> {
    let manager = SessionManager::new(
        Arc::new(network.transport()),
        Arc::new(MemoryStore::new()),
        config.clone(),
    )?;
    manager.start().await?;
    manager.set_profile(Profile::new(manager.public_key()).with_name(name))?;
    Ok(manager)
}

async fn run_demo(config: &SessionConfig) -> Result<()> {
    let network = MemoryNetwork::new();
    let alice = demo_node(&network, config, "alice").await?;
    let bob = demo_node(&network, config, "bob").await?;
    let carol = demo_node(&network, config, "carol").await?;
    let (alice_key, bob_key, carol_key) =
        (alice.public_key(), bob.public_key(), carol.public_key());

    println!("Contact handshake: alice -> bob");
    let direct = alice
        .request_contact(bob_key, &bob.routing_address())
        .await?;
    wait_until("bob to receive the request", || {
        Ok(bob.contact_requests()?.iter().any(|r| r.key() == alice_key))
    })
    .await?;
    bob.accept_contact(alice_key).await?;
    wait_until("alice to see bob accept", || {
        Ok(alice
            .contact(&bob_key)?
            .is_some_and(|c| c.state == ContactState::Accepted))
    })
    .await?;
    println!("  Direct topic: {}", direct);

    alice.send_text(direct, "hello bob").await?;
    wait_until("bob to receive the message", || {
        Ok(bob
            .conversation(&direct)?
            .is_some_and(|c| !c.messages().is_empty()))
    })
    .await?;
    bob.send_text(direct, "hi alice").await?;
    wait_until("alice to receive the reply", || {
        Ok(alice
            .conversation(&direct)?
            .is_some_and(|c| c.messages().len() >= 2))
    })
    .await?;

    // carol is not a contact of alice and is left out of the invite
    println!("Channel: alice invites bob and carol");
    let channel = alice
        .create_channel("planning", vec![bob_key, carol_key], false)
        .await?;
    wait_until("bob to join the channel", || Ok(bob.is_joined(&channel))).await?;
    println!("  Channel topic: {}", channel);

    bob.send_text(channel, "glad to be here").await?;
    wait_until("alice to receive the channel message", || {
        Ok(alice
            .conversation(&channel)?
            .is_some_and(|c| !c.messages().is_empty()))
    })
    .await?;
    println!();

    print_state("alice", &alice)?;
    print_state("bob", &bob)?;
    print_state("carol", &carol)?;

    for manager in [&alice, &bob, &carol] {
        manager.shutdown();
    }
    Ok(())
}

async fn run_node(
    config: SessionConfig,
    name: Option<String>,
    request: Option<String>,
    address: Option<String>,
    auto_accept: bool,
) -> Result<()> {
    println!("Starting swarmchat node...");
    println!();

    let transport = Arc::new(IrohTransport::bind().await?);
    let manager = SessionManager::new(transport.clone(), Arc::new(MemoryStore::new()), config)?;
    let mut events = manager.subscribe_events();
    manager.start().await?;

    if let Some(name) = name {
        manager.set_profile(Profile::new(manager.public_key()).with_name(name))?;
    }

    println!("Node:");
    println!("  Key: {}", manager.public_key());
    println!("  Address: {}", manager.routing_address());
    println!("  Contact topic: {}", manager.contact_topic());
    println!();

    if let Some(key) = request {
        let key = parse_key(&key)?;
        let topic = manager
            .request_contact(key, address.as_deref().unwrap_or_default())
            .await?;
        println!("Contact request sent to {} (topic {})", key.short(), topic.short());
    }

    println!("Listening. Press Ctrl+C to stop.");
    println!();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", describe_event(&manager, &event));
                    if let SessionEvent::ContactRequestReceived(request) = &event {
                        if auto_accept {
                            match manager.accept_contact(request.key()).await {
                                Ok(topic) => println!("Accepted {} (topic {})", request.key().short(), topic.short()),
                                Err(e) => warn!(error = %e, "Failed to accept contact request"),
                            }
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    manager.shutdown();
    transport.shutdown().await;
    println!("Node stopped.");
    Ok(())
}

fn run_decode(envelope: &str) -> Result<()> {
    let codec = EnvelopeCodec::default();
    match codec.try_decode(envelope.as_bytes())? {
        Decoded::Event(ProtocolEvent::Unknown { kind }) => {
            println!("Kind: {} (unknown, ignored)", kind);
        }
        Decoded::Event(event) => {
            println!("Kind: {}", event.kind());
            println!("{}", serde_json::to_string_pretty(&event)?);
        }
        Decoded::Duplicate(nonce) => {
            println!("Duplicate nonce: {}", nonce);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging)?;

    match cli.command {
        Commands::ContactTopic { key } => {
            let key = parse_key(&key)?;
            let name = contact_topic_name(&config.contact_topic_prefix, &key);
            println!("Contact topic: {}", TopicId::from_name(&name));
        }

        Commands::Decode { envelope } => run_decode(&envelope)?,

        Commands::Demo => run_demo(&config).await?,

        Commands::Node {
            name,
            request,
            address,
            auto_accept,
        } => run_node(config, name, request, address, auto_accept).await?,
    }

    Ok(())
}
