use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub staging_dir: PathBuf,
    pub capability_authority: String,
    pub capability_ttl: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path: PathBuf = std::env::var("COURIER_DB_PATH")
            .unwrap_or_else(|_| "courier.db".into())
            .into();
        let staging_dir: PathBuf = std::env::var("COURIER_STAGING_DIR")
            .unwrap_or_else(|_| "./staging".into())
            .into();
        let capability_authority =
            std::env::var("COURIER_CAPABILITY_AUTHORITY").unwrap_or_else(|_| "courier.files".into());
        let ttl_secs: u64 = std::env::var("COURIER_CAPABILITY_TTL_SECS")
            .unwrap_or_else(|_| "300".into())
            .parse()?;

        Ok(Self {
            db_path,
            staging_dir,
            capability_authority,
            capability_ttl: Duration::from_secs(ttl_secs),
        })
    }
}
