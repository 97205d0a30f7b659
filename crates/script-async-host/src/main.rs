//! Script Async Host
//!
//! Boots one async command registry, registers a few in-process engines with
//! scripts that keep timers, sensors, listens, dataserver and HTTP requests
//! pending, and lets the scheduler drive them until the run ends.

mod local;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use script_async::plugin::ListenFilter;
use script_async::world::{HttpRequestSpec, SenseQuery};
use script_async::{AsyncCommandManager, EngineHandle, EngineRegistry, ManagerConfig, ScriptEngine};

use local::{ConsoleEngine, LocalScene};

/// Async command manager host
#[derive(Parser, Debug)]
#[command(name = "script-async-host")]
#[command(about = "Drive script async commands with in-process engines", long_about = None)]
struct Args {
    /// TOML config file with an [async_commands] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of script engines
    #[arg(long, default_value = "2")]
    engines: usize,

    /// Scripts per engine
    #[arg(long, default_value = "4")]
    scripts: u32,

    /// Seconds to run before shutting down (Ctrl-C stops early)
    #[arg(long, default_value = "5")]
    duration_secs: u64,

    /// Override the scheduler cycle interval
    #[arg(long)]
    loop_ms: Option<u64>,
}

/// A script kept alive by the host
struct HostedScript {
    local_id: u32,
    item_id: Uuid,
    host_id: Uuid,
}

fn main() -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("script_async=info,script_async_host=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting script async host v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => ManagerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(loop_ms) = args.loop_ms {
        config = config.with_loop_ms(loop_ms.max(1));
    }
    info!(
        "Scheduler cycle {}ms, {} engines x {} scripts",
        config.async_command_loop_ms, args.engines, args.scripts
    );

    let registry = EngineRegistry::new(config);

    let mut hosted = Vec::with_capacity(args.engines);
    for index in 0..args.engines {
        let scene = LocalScene::new(3);
        let engine = ConsoleEngine::new(format!("engine-{index}"), scene);
        let manager = AsyncCommandManager::new(registry.clone(), EngineHandle::from(engine.clone()))?;
        let scripts = (1..=args.scripts)
            .map(|local_id| start_script(&manager, local_id))
            .collect::<Result<Vec<_>>>()?;
        hosted.push((engine, manager, scripts));
    }

    // Chatter so listens have something to hear
    let scenes: Vec<Arc<LocalScene>> = hosted.iter().map(|(e, _, _)| e.scene().clone()).collect();
    let chatter = tokio::spawn(async move {
        let speaker = Uuid::new_v4();
        let mut tick = tokio::time::interval(Duration::from_millis(750));
        let mut n = 0u64;
        loop {
            tick.tick().await;
            n += 1;
            for scene in &scenes {
                scene.say(0, "Visitor", speaker, &format!("hello {n}"));
            }
        }
    });

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration_secs)) => {
            info!("Run finished after {}s", args.duration_secs);
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted");
        }
    }
    chatter.abort();

    // Hand-off sample: what the first script would carry across a restart
    let sample = hosted
        .first()
        .and_then(|(_, manager, scripts)| scripts.first().map(|script| (manager, script)));
    if let Some((manager, script)) = sample {
        let data = manager.serialize_script(script.item_id)?;
        println!("Serialized script {}/{}:", script.local_id, script.item_id);
        println!("{}", serde_json::to_string_pretty(&data)?);

        let restored = AsyncCommandManager::new(
            registry.clone(),
            EngineHandle::from(ConsoleEngine::new("restore-check".to_string(), LocalScene::new(0))),
        )?;
        restored.restore_script(script.local_id, script.item_id, script.host_id, &data)?;
        info!(
            "Restored {} pending operations into a fresh engine",
            restored.bundle().total_pending(script.item_id)
        );
        restored.unregister_script(script.local_id, script.item_id, true)?;
    }

    registry.shutdown()?;

    let stats = registry.stats();
    println!("Passes: {}, failed checks: {}", stats.passes, stats.failures);
    for (engine, manager, scripts) in &hosted {
        let pending: usize = scripts
            .iter()
            .map(|s| manager.bundle().total_pending(s.item_id))
            .sum();
        println!("{}: {:?} (pending {})", engine.name(), engine.counts(), pending);

        for script in scripts {
            manager.unregister_script(script.local_id, script.item_id, true)?;
        }
    }

    info!("Host stopped");
    Ok(())
}

/// Give a new script one operation of each locally supported kind
fn start_script(manager: &AsyncCommandManager, local_id: u32) -> Result<HostedScript> {
    let item_id = Uuid::new_v4();
    let host_id = Uuid::new_v4();
    let cycle = manager.registry().config().cycle_interval();

    manager
        .timer()
        .set_timer_event(local_id, item_id, cycle * (local_id + 1));

    manager.sensor_repeat().sense_repeat(
        local_id,
        item_id,
        host_id,
        SenseQuery {
            name: String::new(),
            key: None,
            type_mask: u32::MAX,
            range: local_id as f64,
            arc: std::f64::consts::PI,
        },
        Duration::from_secs(1),
    );

    manager
        .listener()
        .listen(local_id, item_id, host_id, ListenFilter::channel(0))?;

    let identifier = format!("{item_id}:owner");
    if manager
        .dataserver()
        .register_request(local_id, item_id, &identifier)
        .is_some()
    {
        manager.dataserver().reply(&identifier, "Host Owner");
    }

    manager.http_request().start_request(
        local_id,
        item_id,
        HttpRequestSpec::get(format!("http://localhost/scripts/{item_id}")),
    )?;

    Ok(HostedScript {
        local_id,
        item_id,
        host_id,
    })
}
