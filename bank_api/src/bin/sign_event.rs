//! Helper CLI: produce a signed event body for the bank's write endpoints.
//!
//! Examples:
//!   sign-event --secret-key <hex> --kind 30051 \
//!     --content '{"market":"BTC-USD-PERP","side":"long","order_type":"limit","size_sats":100000,"price_usd":50000,"leverage":5}'
//!   sign-event --secret-key <hex> --kind 1 --content 'bank:1700000000:1a2b3c4d'

use anyhow::{anyhow, Result};
use clap::Parser;
use engine::nostr::{SchnorrSigner, Signer};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(name = "sign-event", about = "Generate a signed event JSON body for the bank API")]
struct Args {
    /// 64-hex secret key. A fresh key is generated (and printed) when
    /// omitted.
    #[arg(long)]
    secret_key: Option<String>,
    #[arg(long, default_value_t = 30051)]
    kind: u32,
    /// Event content, verbatim.
    #[arg(long)]
    content: String,
    /// Tags as name=value pairs, repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Unix seconds; defaults to the current time.
    #[arg(long)]
    created_at: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let signer = match &args.secret_key {
        Some(secret) => SchnorrSigner::from_hex(secret).map_err(|e| anyhow!("{e}"))?,
        None => {
            eprintln!("no --secret-key given, using a freshly generated key");
            SchnorrSigner::generate()
        }
    };

    let tags = args
        .tags
        .iter()
        .map(|t| {
            let (name, value) = t
                .split_once('=')
                .ok_or_else(|| anyhow!("tag must be name=value: {t}"))?;
            Ok(vec![name.to_string(), value.to_string()])
        })
        .collect::<Result<Vec<_>>>()?;

    let created_at = match args.created_at {
        Some(ts) => ts,
        None => SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs(),
    };

    let event = signer.sign(args.kind, tags, args.content, created_at);
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "signed_event": event }))?
    );
    Ok(())
}
