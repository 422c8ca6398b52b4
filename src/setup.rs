//! `setup`: prepare the storage home and report what is configured.
//!
//! Steps run in order and each prints `✓` or `✗`. Database steps stop at the
//! first failure; key and embedding checks are informational unless
//! embeddings are enabled without a key.

use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::MediaKind;
use crate::openai;
use crate::store;

#[derive(Debug, Clone, Serialize)]
pub struct SetupCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl SetupCheck {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            detail: detail.into(),
        }
    }
}

pub async fn setup_checks(config: &Config) -> Vec<SetupCheck> {
    let mut checks = Vec::new();

    let home = &config.store.home;
    match std::fs::create_dir_all(home) {
        Ok(()) => checks.push(SetupCheck::pass("storage home", home.display().to_string())),
        Err(e) => {
            checks.push(SetupCheck::fail("storage home", format!("{}: {}", home.display(), e)));
            return checks;
        }
    }

    let pool = match db::connect(config).await {
        Ok(pool) => pool,
        Err(e) => {
            checks.push(SetupCheck::fail("database", format!("{:#}", e)));
            return checks;
        }
    };

    match migrate::migrate_pool(&pool).await {
        Ok(()) => checks.push(SetupCheck::pass(
            "migrations",
            config.store.db_path().display().to_string(),
        )),
        Err(e) => {
            checks.push(SetupCheck::fail("migrations", format!("{:#}", e)));
            pool.close().await;
            return checks;
        }
    }

    match store::probe(&pool).await {
        Ok(()) => checks.push(SetupCheck::pass("database probe", "write/read/delete ok")),
        Err(e) => checks.push(SetupCheck::fail("database probe", format!("{:#}", e))),
    }
    pool.close().await;

    let key_set = openai::api_key(&config.media).is_some();
    let media_kinds: Vec<&str> = MediaKind::ALL
        .into_iter()
        .filter(|k| k.requires_api_key())
        .map(|k| k.as_str())
        .collect();
    checks.push(SetupCheck::pass(
        "api key",
        if key_set {
            format!("{} set", config.media.api_key_env)
        } else {
            format!(
                "{} not set; {} servers will not start",
                config.media.api_key_env,
                media_kinds.join("/")
            )
        },
    ));

    let emb = &config.embedding;
    if !emb.is_enabled() {
        checks.push(SetupCheck::pass("embeddings", "disabled (keyword search only)"));
    } else if !key_set {
        checks.push(SetupCheck::fail(
            "embeddings",
            format!("provider '{}' needs {}", emb.provider, config.media.api_key_env),
        ));
    } else {
        checks.push(SetupCheck::pass(
            "embeddings",
            format!(
                "{} {} ({} dims)",
                emb.provider,
                emb.model.as_deref().unwrap_or("?"),
                emb.dims.unwrap_or(0)
            ),
        ));
    }

    checks
}

/// Print the checks. Returns `false` when any failed.
pub async fn run_setup(config: &Config) -> Result<bool> {
    let checks = setup_checks(config).await;
    println!("takeout-ingest setup");
    for check in &checks {
        println!(
            "  {} {:<15} {}",
            if check.ok { "✓" } else { "✗" },
            check.name,
            check.detail
        );
    }
    let ok = checks.iter().all(|c| c.ok);
    println!("{}", if ok { "ready" } else { "setup incomplete" });
    Ok(ok)
}
