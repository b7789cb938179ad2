use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use zeroize::Zeroizing;

use storefront_sync::api::auth::{get_or_create_master_secret, KeychainTokenStore};
use storefront_sync::api::types::HttpMethod;
use storefront_sync::api::ApiClient;
use storefront_sync::config::Config;
use storefront_sync::connectivity::{probe_once, spawn_probe, ConnectivityObserver};
use storefront_sync::crypto::{decode_master_secret, derive_key, STORE_KEY_INFO};
use storefront_sync::deeplink::{self, DeepLinkRoute};
use storefront_sync::state::AppState;
use storefront_sync::status::SyncStatus;
use storefront_sync::storage::{EncryptedStore, FileStore};
use storefront_sync::sync::{self, MutationAction, QueueItem, SyncDaemon};

#[derive(Parser, Debug)]
#[command(
    name = "storefront-sync",
    version,
    about = "Offline mutation queue for the storefront client"
)]
struct Cli {
    /// Backend base URL (overrides STOREFRONT_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Directory for persisted state (overrides STOREFRONT_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Short-circuit every request as if the device were offline
    #[arg(long, global = true)]
    force_offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connectivity, queue and session summary
    Status,
    Login {
        email: String,
        #[arg(long, env = "STOREFRONT_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    /// Queue a raw mutation
    Enqueue {
        /// create, update or delete
        action: MutationAction,
        /// Path relative to the API base URL, e.g. /api/addresses/
        endpoint: String,
        #[arg(long, default_value = "POST")]
        method: HttpMethod,
        /// JSON body
        #[arg(long, default_value = "null")]
        payload: String,
    },
    /// Run one drain pass and exit
    Drain,
    /// Keep draining in the background until Ctrl+C
    Daemon,
    #[command(subcommand)]
    Cart(CartCommand),
    /// Refresh and list the product catalog
    Catalog,
    #[command(subcommand)]
    DeadLetters(DeadLetterCommand),
    /// Resolve a deep link to an app route
    Deeplink { url: String },
}

#[derive(Subcommand, Debug)]
enum CartCommand {
    Show,
    Add {
        product_id: u64,
        #[arg(default_value_t = 1)]
        quantity: u32,
    },
    Set { product_id: u64, quantity: u32 },
    Remove { product_id: u64 },
    /// Fetch the server cart and merge it
    Refresh,
}

#[derive(Subcommand, Debug)]
enum DeadLetterCommand {
    List,
    /// Move a dead letter back to the pending queue
    Retry { id: String },
    /// Drop a queued mutation for good
    Discard { id: String },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    if let Command::Deeplink { url } = &cli.command {
        match deeplink::parse(url) {
            DeepLinkRoute::OrderDetail {
                order_id,
                order_number,
            } => println!(
                "order detail (id: {}, number: {})",
                order_id.as_deref().unwrap_or("-"),
                order_number.as_deref().unwrap_or("-")
            ),
            DeepLinkRoute::Unknown => println!("unknown route"),
        }
        return Ok(());
    }

    let mut config = Config::from_env().map_err(|e| e.to_string())?;
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let state = Arc::new(build_state(&config, cli.force_offline).await?);
    state.restore().await;

    match cli.command {
        Command::Status => print_status(&state).await,
        Command::Login { email, password } => {
            state
                .login(&email, &password)
                .await
                .map_err(|e| e.user_message())?;
            println!("Logged in as {}", email);
        }
        Command::Logout => {
            state.logout().await.map_err(|e| e.user_message())?;
            println!("Logged out");
        }
        Command::Enqueue {
            action,
            endpoint,
            method,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload)
                .map_err(|e| format!("Payload is not valid JSON: {}", e))?;
            let id = state
                .queue
                .enqueue(action, &endpoint, method, payload)
                .await
                .map_err(|e| format!("Enqueue failed: {}", e))?;
            println!("{}", id);
        }
        Command::Drain => {
            let mut synced_rx = state.runner.subscribe_synced();
            let report = state.runner.drain().await;
            while let Ok(synced) = synced_rx.try_recv() {
                state.apply_synced(&synced).await;
            }
            match report.skipped {
                Some(reason) => println!("Drain skipped: {:?}", reason),
                None => println!(
                    "{} batch(es): {} synced, {} failed, {} dead-lettered, {} deferred",
                    report.batches,
                    report.succeeded,
                    report.failed,
                    report.dead_lettered,
                    report.deferred
                ),
            }
        }
        Command::Daemon => run_daemon(state, &config).await,
        Command::Cart(cmd) => run_cart(&state, cmd).await?,
        Command::Catalog => {
            if let Err(e) = state.refresh_catalog().await {
                eprintln!("Catalog refresh failed, showing cached catalog: {}", e.user_message());
            }
            let products = state.products.read().await;
            for p in &products.products {
                println!("{:>6}  {:<32} {:>8.2}", p.id, p.name, p.price_cents as f64 / 100.0);
            }
        }
        Command::DeadLetters(cmd) => match cmd {
            DeadLetterCommand::List => {
                for item in state.queue.dead_letters().await {
                    print_item(&item);
                }
            }
            DeadLetterCommand::Retry { id } => {
                state
                    .queue
                    .retry_dead_letter(&id)
                    .await
                    .map_err(|e| e.to_string())?;
                println!("Requeued {}", id);
            }
            DeadLetterCommand::Discard { id } => {
                let item = state.queue.discard(&id).await.map_err(|e| e.to_string())?;
                println!("Discarded {:?} {}", item.method, item.endpoint);
            }
        },
        Command::Deeplink { .. } => {}
    }
    Ok(())
}

async fn build_state(config: &Config, force_offline: bool) -> Result<AppState, String> {
    let secret = get_or_create_master_secret().map_err(|e| format!("Keychain read failed: {}", e))?;
    let master = Zeroizing::new(decode_master_secret(&secret).map_err(|e| e.to_string())?);
    let key = derive_key(&master, STORE_KEY_INFO).map_err(|e| e.to_string())?;

    let files = FileStore::open(&config.data_dir)
        .await
        .map_err(|e| format!("Cannot open {}: {}", config.data_dir.display(), e))?;
    let store = Arc::new(EncryptedStore::new(files, key));

    let connectivity = Arc::new(ConnectivityObserver::default());
    connectivity.force_offline(force_offline);
    let api = Arc::new(ApiClient::new(
        &config.api_url,
        Arc::new(KeychainTokenStore),
        connectivity.clone(),
    ));
    if !force_offline {
        connectivity.update(probe_once(api.http(), &config.api_url).await);
    }

    log::debug!("Using data dir {}", config.data_dir.display());
    Ok(AppState::new(
        api,
        store,
        config.sync.clone(),
        config.dead_letter_after,
    ))
}

async fn run_daemon(state: Arc<AppState>, config: &Config) {
    let (trigger, sync_now_rx) = sync::trigger_channel();
    state.queue.set_drain_trigger(trigger);

    let probe = spawn_probe(
        state.connectivity.clone(),
        state.api.http().clone(),
        config.api_url.clone(),
        config.probe_interval,
    );

    let mut daemon = SyncDaemon::new(
        state.runner.clone(),
        state.connectivity.subscribe(),
        sync_now_rx,
    )
    .with_poll_interval(config.sync_interval);
    let mut status_rx = daemon.subscribe_status();
    let mut pending_rx = state.queue.subscribe_pending();

    let reconciler = {
        let state = state.clone();
        let synced_rx = state.runner.subscribe_synced();
        tokio::spawn(async move { state.run_cart_reconciler(synced_rx).await })
    };
    let watcher = {
        let state = state.clone();
        tokio::spawn(async move { state.run_session_watcher().await })
    };
    let daemon_task = tokio::spawn(async move { daemon.run().await });

    state.queue.notify_pending().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutting down sync daemon");
                break;
            }
            Ok(()) = status_rx.changed() => {
                let status = status_rx.borrow_and_update().clone();
                report_status(&status, *pending_rx.borrow());
            }
            Ok(()) = pending_rx.changed() => {
                let pending = *pending_rx.borrow_and_update();
                report_status(&status_rx.borrow(), pending);
            }
        }
    }

    daemon_task.abort();
    reconciler.abort();
    watcher.abort();
    probe.abort();
}

fn report_status(status: &SyncStatus, pending: usize) {
    match status {
        SyncStatus::Error(message) => log::warn!("{}: {}", status.badge(pending), message),
        _ => log::info!("{}", status.badge(pending)),
    }
}

async fn run_cart(state: &AppState, cmd: CartCommand) -> Result<(), String> {
    match cmd {
        CartCommand::Show => {}
        CartCommand::Add {
            product_id,
            quantity,
        } => {
            let product = state
                .products
                .read()
                .await
                .product(product_id)
                .cloned()
                .ok_or_else(|| format!("Unknown product {}; run `catalog` first", product_id))?;
            state
                .add_to_cart(&product, quantity)
                .await
                .map_err(|e| e.to_string())?;
        }
        CartCommand::Set {
            product_id,
            quantity,
        } => {
            state
                .set_cart_quantity(product_id, quantity)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("Product {} is not in the cart", product_id))?;
        }
        CartCommand::Remove { product_id } => {
            state
                .remove_from_cart(product_id)
                .await
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("Product {} is not in the cart", product_id))?;
        }
        CartCommand::Refresh => {
            if let Err(e) = state.refresh_cart().await {
                eprintln!("Cart refresh failed: {}", e.user_message());
            }
        }
    }

    let cart = state.cart.read().await;
    for line in &cart.lines {
        let marker = if cart.has_unacknowledged(line.product_id) { "*" } else { " " };
        println!(
            "{}{:>6}  {:<32} x{:<4} {:>8.2}",
            marker,
            line.product_id,
            line.name,
            line.quantity,
            (line.unit_price_cents * u64::from(line.quantity)) as f64 / 100.0
        );
    }
    println!("{} item(s), total {:.2}", cart.item_count, cart.total_cents as f64 / 100.0);
    Ok(())
}

async fn print_status(state: &AppState) {
    let snapshot = state.connectivity.snapshot();
    println!(
        "connectivity: {} ({}, forced offline: {})",
        if state.connectivity.is_online() { "online" } else { "offline" },
        snapshot.kind,
        state.connectivity.is_forced_offline()
    );

    let auth = state.auth.read().await;
    match (&auth.email, auth.session_expired) {
        (_, true) => println!("session: expired, log in again"),
        (Some(email), false) if auth.is_authenticated => println!("session: {}", email),
        _ => println!("session: logged out"),
    }

    let items = state.queue.get_all().await;
    println!(
        "queue: {} pending, {} dead letters, {} total",
        state.queue.pending_count().await,
        state.queue.dead_letters().await.len(),
        items.len()
    );
    for item in &items {
        print_item(item);
    }
}

fn print_item(item: &QueueItem) {
    println!(
        "  {}  {:?} {:?} {}  [{:?}, {} failed attempt(s)]{}",
        item.id,
        item.action,
        item.method,
        item.endpoint,
        item.status,
        item.retry_count,
        item.last_error
            .as_deref()
            .map(|e| format!(" last error: {}", e))
            .unwrap_or_default()
    );
}
