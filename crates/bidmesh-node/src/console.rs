//! Interactive operator console

use crate::error::NodeResult;
use crate::node::Node;
use bidmesh_network::{BroadcastReport, Identity};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::debug;

const PROMPT: &str = "> ";

const HELP: &str = "\
commands:
  open <item> <price>   open an auction
  bid <item> <price>    bid on an open auction
  close <item>          close your auction and report the winner
  peers                 list linked peers
  show <item>           show the local record for an item
  help                  this text
  quit                  leave the mesh";

/// One parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum LocalCommand {
    /// Open an auction
    Open {
        /// Item
        item: String,
        /// Opening price
        price: f64,
    },
    /// Bid on an auction
    Bid {
        /// Item
        item: String,
        /// Offered price
        price: f64,
    },
    /// Close own auction
    Close {
        /// Item
        item: String,
    },
    /// List linked peers
    Peers,
    /// Show a record
    Show {
        /// Item
        item: String,
    },
    /// Print usage
    Help,
    /// Exit
    Quit,
}

impl LocalCommand {
    /// Parse a console line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&verb, args)) = words.split_first() else {
            return Ok(None);
        };

        let cmd = match (verb, args) {
            ("open", [item, price]) => LocalCommand::Open {
                item: item.to_string(),
                price: parse_price(price)?,
            },
            ("bid", [item, price]) => LocalCommand::Bid {
                item: item.to_string(),
                price: parse_price(price)?,
            },
            ("close", [item]) => LocalCommand::Close {
                item: item.to_string(),
            },
            ("show", [item]) => LocalCommand::Show {
                item: item.to_string(),
            },
            ("peers", []) => LocalCommand::Peers,
            ("help", []) => LocalCommand::Help,
            ("quit" | "exit", []) => LocalCommand::Quit,
            ("open" | "bid", _) => return Err(format!("usage: {} <item> <price>", verb)),
            ("close" | "show", _) => return Err(format!("usage: {} <item>", verb)),
            ("peers" | "help" | "quit" | "exit", _) => {
                return Err(format!("{} takes no arguments", verb))
            }
            _ => return Err(format!("unknown command: {} (try help)", verb)),
        };
        Ok(Some(cmd))
    }
}

/// Parse a price; it must be a finite, non-negative number
pub fn parse_price(raw: &str) -> Result<f64, String> {
    let price: f64 = raw
        .parse()
        .map_err(|_| format!("price is not a number: {}", raw))?;
    if !price.is_finite() {
        return Err(format!("price must be finite: {}", raw));
    }
    if price < 0.0 {
        return Err(format!("price must not be negative: {}", raw));
    }
    Ok(price)
}

fn delivery(report: &BroadcastReport) -> String {
    let mut out = format!(
        "delivered to {}/{} peers",
        report.delivered.len(),
        report.attempted()
    );
    for (peer, reason) in &report.failed {
        out.push_str(&format!("\n  {} unreachable: {}", peer.short(), reason));
    }
    out
}

/// Run one command against `node` and describe the result
pub async fn execute(node: &Node, cmd: &LocalCommand) -> String {
    match cmd {
        LocalCommand::Open { item, price } => match node.open(item, *price).await {
            Ok(outcome) => format!(
                "opened {} at {} ({})",
                outcome.item,
                outcome.price,
                delivery(&outcome.report)
            ),
            Err(e) => format!("open rejected: {}", e),
        },
        LocalCommand::Bid { item, price } => match node.bid(item, *price).await {
            Ok(outcome) => format!(
                "bid {} on {}, previous top {} ({})",
                outcome.price,
                outcome.item,
                outcome.previous,
                delivery(&outcome.report)
            ),
            Err(e) => format!("bid rejected: {}", e),
        },
        LocalCommand::Close { item } => match node.close(item).await {
            Ok(outcome) => {
                let result = match &outcome.winner {
                    Some(winner) => format!("sold to {} for {}", winner.short(), outcome.price),
                    None => "no bids".to_string(),
                };
                format!(
                    "closed {}: {} ({})",
                    outcome.item,
                    result,
                    delivery(&outcome.report)
                )
            }
            Err(e) => format!("close rejected: {}", e),
        },
        LocalCommand::Peers => {
            let peers = node.peers();
            if peers.is_empty() {
                return "no linked peers".to_string();
            }
            let mut out = format!("{} linked peers:", peers.len());
            for peer in peers {
                out.push_str(&format!("\n  {}", peer));
            }
            out
        }
        LocalCommand::Show { item } => match node.show(item) {
            Ok(Some(record)) => {
                let top = match &record.top_bidder_id {
                    Some(bidder) => format!("top {} by {}", record.top_price, bidder.short()),
                    None => format!("opening price {}, no bids", record.top_price),
                };
                let auctioneer = record
                    .auctioneer_id
                    .as_ref()
                    .map(Identity::short)
                    .unwrap_or("unknown");
                format!("{}: {}, auctioneer {}", item, top, auctioneer)
            }
            Ok(None) => format!("{}: no open auction", item),
            Err(e) => format!("show failed: {}", e),
        },
        LocalCommand::Help => HELP.to_string(),
        LocalCommand::Quit => "bye".to_string(),
    }
}

/// Read commands from stdin until `quit` or end of input
pub async fn run_console(node: Arc<Node>) -> NodeResult<()> {
    let mut notices = node.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => println!("\n* {}", notice),
                Err(RecvError::Lagged(missed)) => debug!(missed, "console fell behind on notices"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("node {}", node.identity());
    println!("mesh endpoint {}, type help for commands", node.endpoint());

    // Blocking stdin reads stay on their own thread so shutdown never waits on them
    let (line_tx, mut lines) = mpsc::channel::<std::io::Result<String>>(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    loop {
        print!("{}", PROMPT);
        std::io::stdout().flush()?;

        let Some(line) = lines.recv().await else {
            break;
        };
        match LocalCommand::parse(&line?) {
            Ok(None) => {}
            Ok(Some(LocalCommand::Quit)) => break,
            Ok(Some(cmd)) => println!("{}", execute(&node, &cmd).await),
            Err(e) => println!("{}", e),
        }
    }

    printer.abort();
    Ok(())
}
