// =============================================================================
// ROMER - Main Entry Point
// Payment channel node: demo network, config and invoice tools
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use clap::{Parser, Subcommand};

use romer::config::network_from_token;
use romer::store::MemoryStore;
use romer::{
    format_sats, InMemoryNetwork, Invoice, Node, NodeConfig, NodeError, NodeEvent, NodeKeys,
};

const DEFAULT_DEMO_AMOUNT: u64 = 25_000;

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "romer")]
#[command(version = "0.1.0")]
#[command(about = "Romer - payment channels and multi-hop routing", long_about = None)]
struct Cli {
    /// Node config (JSON); defaults are used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run three nodes in-process and route a payment through the middle one
    Demo {
        /// Amount to pay in satoshis
        #[arg(long, default_value_t = DEFAULT_DEMO_AMOUNT)]
        amount: u64,
    },

    /// Show which network an API token selects
    Token {
        token: String,
    },

    /// Write a config file with every default filled in
    Config {
        /// Output path
        output: PathBuf,
        /// API token naming the network
        #[arg(long)]
        token: Option<String>,
    },

    /// Decode and verify an invoice
    DecodeInvoice {
        invoice: String,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match NodeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("  ❌ {}", e);
                std::process::exit(1);
            }
        },
        None => NodeConfig::default(),
    };

    let result = match cli.command {
        Some(Commands::Demo { amount }) => cmd_demo(config, amount).await,
        None => cmd_demo(config, DEFAULT_DEMO_AMOUNT).await,
        Some(Commands::Token { token }) => cmd_token(&token),
        Some(Commands::Config { output, token }) => cmd_config(output, token),
        Some(Commands::DecodeInvoice { invoice }) => cmd_decode_invoice(&invoice),
    };

    if let Err(e) = result {
        eprintln!("  ❌ {}", e);
        std::process::exit(1);
    }
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_token(token: &str) -> Result<(), NodeError> {
    let network = network_from_token(token)?;
    println!("  Network: {}", network);
    println!("  Invoice prefix: {}", network.invoice_prefix());
    Ok(())
}

fn cmd_config(output: PathBuf, token: Option<String>) -> Result<(), NodeError> {
    let config = match token {
        Some(token) => NodeConfig::from_token(&token)?,
        None => NodeConfig::default(),
    };
    config.save(&output)?;
    println!("  ✅ Config written to {}", output.display());
    Ok(())
}

fn cmd_decode_invoice(encoded: &str) -> Result<(), NodeError> {
    let invoice = Invoice::decode(encoded)?;
    println!("  Network:      {}", invoice.network);
    println!("  Payee:        {}", invoice.payee);
    println!("  Payment hash: {}", invoice.payment_hash);
    println!("  Amount:       {}", format_sats(invoice.amount));
    println!("  Description:  {}", invoice.description);
    println!("  Expires at:   {}{}", invoice.expires_at(), if invoice.is_expired() { " (expired)" } else { "" });
    println!("  Final CLTV:   {}", invoice.min_final_cltv);
    Ok(())
}

async fn cmd_demo(config: NodeConfig, amount: u64) -> Result<(), NodeError> {
    println!();
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║           ROMER PAYMENT ROUTING DEMO                      ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();

    // =========================================================================
    // 1. Nodes
    // =========================================================================
    println!("  1️⃣  NODES");
    println!("  ─────────────────────────────────────────────────────────────");

    let network = InMemoryNetwork::new();
    let mut nodes = Vec::new();
    for alias in ["alice", "bob", "carol"] {
        let keys = NodeKeys::generate();
        let inbox = network.register(keys.node_id());
        let node_config = NodeConfig { alias: alias.to_string(), data_dir: None, ..config.clone() };
        let node = Node::new(
            node_config,
            keys.clone(),
            Arc::new(MemoryStore::new()),
            network.endpoint(keys.node_id()),
        )?;
        node.start(inbox);
        println!("  {:<6} {}", alias, node.node_id());
        nodes.push(node);
    }
    let (alice, bob, carol) = (&nodes[0], &nodes[1], &nodes[2]);
    println!();

    // =========================================================================
    // 2. Channels
    // =========================================================================
    println!("  2️⃣  CHANNELS");
    println!("  ─────────────────────────────────────────────────────────────");

    let capacity = 1_000_000;
    let ab = alice.open_channel(bob.node_id(), capacity, 0).await?;
    let bc = bob.open_channel(carol.node_id(), capacity, 0).await?;
    println!("  alice ─▶ bob    {}  {}", ab, format_sats(capacity));
    println!("  bob   ─▶ carol  {}  {}", bc, format_sats(capacity));

    let confirmations = config.channel.funding_confirmations;
    for height in 1..=confirmations {
        for node in &nodes {
            node.process_block(height).await?;
        }
    }
    println!("  {} blocks mined, channels active", confirmations);

    let gossip: Vec<_> = nodes.iter().flat_map(|n| n.gossip()).collect();
    for node in &nodes {
        node.apply_gossip(&gossip);
    }
    let status = alice.status();
    println!("  Alice's graph: {} nodes, {} channels", status.graph_nodes, status.graph_channels);
    println!();

    // =========================================================================
    // 3. Payment
    // =========================================================================
    println!("  3️⃣  PAYMENT");
    println!("  ─────────────────────────────────────────────────────────────");

    let mut carol_events = carol.subscribe();
    let invoice = carol.receive(amount, "romer demo")?;
    println!("  Invoice: {}...", &invoice[..invoice.len().min(48)]);

    let success = alice.send(&invoice).await?;
    println!("  ✅ Paid {} in {} attempt(s)", format_sats(amount), success.attempts);
    println!("  Fee:      {} sat", success.fee_paid);
    println!("  Preimage: {}", success.preimage.to_hex());
    for hop in &success.route.hops {
        println!("    ─▶ {} via {} ({} sat, expiry {})", hop.node_id.short(), hop.channel_id, hop.amount, hop.cltv_expiry);
    }

    let received = tokio::time::timeout(config.payment_timeout(), async {
        while let Ok(event) = carol_events.recv().await {
            if let NodeEvent::PaymentReceived { .. } = event {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    println!("  Carol settled invoice: {}", received && carol.invoice_paid(&invoice)?);
    println!();

    // =========================================================================
    // 4. Balances
    // =========================================================================
    println!("  4️⃣  BALANCES");
    println!("  ─────────────────────────────────────────────────────────────");

    for node in &nodes {
        let balances = node.balances();
        println!(
            "  {:<6} lightning {:>9}  outbound {:>9}  inbound {:>9}",
            node.config().alias,
            balances.total_lightning_balance,
            balances.outbound_capacity,
            balances.inbound_capacity
        );
    }
    println!();

    // =========================================================================
    // 5. Close
    // =========================================================================
    println!("  5️⃣  CLOSE");
    println!("  ─────────────────────────────────────────────────────────────");

    alice.close_channel(&ab).await?;
    bob.close_channel(&bc).await?;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    for info in alice.list_channels().iter().chain(bob.list_channels().iter()) {
        println!("  {}  {}", info.channel_id, info.state);
    }

    for node in &nodes {
        node.shutdown();
    }
    println!();
    Ok(())
}
