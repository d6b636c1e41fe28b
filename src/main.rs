use clap::{Arg, ArgAction, Command};
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, Level};

use mailuminati_guardian::config::{GuardianConfig, DEFAULT_CONFIG_PATH};
use mailuminati_guardian::server::AppState;
use mailuminati_guardian::{metrics, oracle, server, ENGINE_VERSION};
use mailuminati_guardian::{ImageAnalyzer, OracleClient, Store};

#[tokio::main]
async fn main() {
    let matches = Command::new("mailuminati-guardian")
        .version(ENGINE_VERSION)
        .about("Local mail analysis engine bridging an MTA to the Mailuminati oracle")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Print the resolved effective configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap().clone();
    let config = Arc::new(GuardianConfig::new());
    let config_load_error = config.load_file(&config_path).err();

    init_logging(&config);
    if let Some(e) = config_load_error {
        tracing::warn!(error = %e, "config file error (using defaults/env)");
    }
    config.refresh();

    if matches.get_flag("test-config") {
        print_effective_config(&config);
        return;
    }

    if let Err(e) = metrics::register_metrics() {
        error!(error = %e, "unable to register metrics");
        process::exit(1);
    }

    // SIGHUP reloads the config file without disturbing in-flight requests;
    // the hot-path knobs are re-derived atomically.
    {
        let config = Arc::clone(&config);
        let path = config_path.clone();
        tokio::spawn(async move {
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "unable to install SIGHUP handler");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("received SIGHUP, reloading configuration");
                if let Err(e) = config.load_file(&path) {
                    error!(error = %e, "error reloading config");
                }
                config.refresh();
            }
        });
    }

    let store = match Store::connect(&config.redis_addr()).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "critical store error");
            process::exit(1);
        }
    };
    if let Err(e) = store.ping().await {
        error!(error = %e, "critical store error");
        process::exit(1);
    }

    let node_id = match store.init_node().await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "unable to initialize node identity");
            process::exit(1);
        }
    };
    info!(version = ENGINE_VERSION, node_id = %node_id, "engine started");

    let oracle_client = match OracleClient::new(config.oracle_url()) {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "unable to build oracle client");
            process::exit(1);
        }
    };
    let images = match ImageAnalyzer::new() {
        Ok(analyzer) => analyzer,
        Err(e) => {
            error!(error = %e, "unable to build image fetcher");
            process::exit(1);
        }
    };

    tokio::spawn(oracle::sync_worker(
        oracle_client.clone(),
        store.clone(),
        node_id.clone(),
    ));
    tokio::spawn(metrics::stats_worker());

    let state = Arc::new(AppState {
        store,
        oracle: oracle_client,
        images,
        config: Arc::clone(&config),
        node_id,
    });
    let app = server::router(state);

    let addr = config.bind_addr();
    info!(address = %addr, "MTA bridge ready");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, address = %addr, "server bind failed");
            process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server failed");
        process::exit(1);
    }
}

fn init_logging(config: &GuardianConfig) {
    let level = match config.get("LOG_LEVEL", "INFO").to_uppercase().as_str() {
        "DEBUG" => Level::DEBUG,
        "WARN" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = tracing_subscriber::fmt().with_max_level(level);
    if config.get("LOG_FORMAT", "JSON").to_uppercase() == "TEXT" {
        builder.init();
    } else {
        builder.json().init();
    }
}

fn print_effective_config(config: &GuardianConfig) {
    println!("Effective configuration:");
    println!("  REDIS_HOST={}", config.get("REDIS_HOST", "localhost"));
    println!("  REDIS_PORT={}", config.get("REDIS_PORT", "6379"));
    println!(
        "  GUARDIAN_BIND_ADDR={}",
        config.get("GUARDIAN_BIND_ADDR", "127.0.0.1")
    );
    println!("  PORT={}", config.get("PORT", "12421"));
    println!("  ORACLE_URL={}", config.oracle_url());
    println!("  SPAM_WEIGHT={}", config.spam_weight());
    println!("  HAM_WEIGHT={}", config.ham_weight());
    println!("  SPAM_THRESHOLD={}", config.spam_threshold());
    println!(
        "  LOCAL_RETENTION_DAYS={}",
        config.retention().as_secs() / (24 * 60 * 60)
    );
    println!(
        "  MI_ENABLE_IMAGE_ANALYSIS={}",
        config.image_analysis_enabled()
    );
    println!("  LOG_LEVEL={}", config.get("LOG_LEVEL", "INFO"));
    println!("  LOG_FORMAT={}", config.get("LOG_FORMAT", "JSON"));
}
