//! Key manager inspection tool
//!
//! Lists every key known to the configured providers and, given an e-mail
//! address, the keys trusted for it per purpose.
//!
//! Usage: `keymgr-inspect [email]`

use anyhow::Result;
use keymgr_config::KeyManagerConfig;
use keymgr_core::{init_key_manager, Key, KeyPurpose, KeyRingType};
use keymgr_logging::init_console_logging;
use tracing::info;

fn describe(key: &Key) -> String {
    format!(
        "{} {:<6} {:<8} {:<8} {}",
        key.fingerprint,
        if key.is_secret { "secret" } else { "public" },
        format!("{:?}", key.lock_state).to_lowercase(),
        key.provider_id,
        key.user_ids.join(", ")
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = KeyManagerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    init_console_logging("keymgr-inspect", config.log_level());

    let manager = init_key_manager(&config, Vec::new()).await?;
    info!(providers = ?manager.registry().provider_ids(), "Key manager ready");

    let keys = manager.get_all_keys(KeyRingType::All, None).await?;
    println!("{} key(s)", keys.len());
    for key in &keys {
        println!("  {}", describe(key));
    }

    if let Some(email) = std::env::args().nth(1) {
        println!();
        println!("Trusted keys for {}", email);
        for purpose in KeyPurpose::ALL {
            let trusted = manager.get_trusted_keys(purpose, &email).await?;
            match manager.trust_record(&email, purpose).await {
                Some(record) => println!("  {} (epoch {}):", purpose, record.epoch),
                None => println!("  {}: no trust record", purpose),
            }
            for key in &trusted {
                println!("    {}", describe(key));
            }
        }
    }

    Ok(())
}
