use std::{error::Error, sync::Arc, time::Duration};

use clap::Parser;
use caflow::{
    Config, QcaContext, QcaObject, SimulatedIoc,
    backend::SimPv,
    signals::{ConnectionInfo, MessageKind},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

/// Monitor PVs served by an in-process simulated IOC
#[derive(Parser)]
struct Options {
    /// PV names to serve and monitor
    #[clap(required = true, id = "PV_NAME")]
    names: Vec<String>,
    /// Also monitor a PV that is never served, to watch it time out
    #[clap(long)]
    missing: Option<String>,
    /// Seconds between simulated value changes
    #[clap(long, default_value_t = 1.0)]
    period: f32,
    /// Seconds to run for
    #[clap(long, default_value_t = 10.0)]
    duration: f32,
    /// Write this value to the first PV once it has connected
    #[clap(long)]
    write: Option<f64>,
    /// Show debug output
    #[clap(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn describe(info: &ConnectionInfo) -> String {
    format!("{} (link {:?})", info.channel_state, info.link_state)
}

#[tokio::main(flavor = "multi_thread", worker_threads = 1)]
async fn main() -> Result<(), Box<dyn Error>> {
    // Make sure panics from threads cause the whole process to terminate
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));
    let opts = Options::parse();

    let filter = EnvFilter::default()
        .add_directive(
            match opts.verbose {
                0 => LevelFilter::INFO,
                1 => LevelFilter::DEBUG,
                2.. => LevelFilter::TRACE,
            }
            .into(),
        )
        .add_directive("tokio=off".parse()?)
        .add_directive("runtime=off".parse()?);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_filter(filter);
    let subscriber = tracing_subscriber::registry().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    let ioc = SimulatedIoc::new(2)?;
    for name in &opts.names {
        ioc.add_pv_with(
            name,
            SimPv::new(0.0f64)
                .units("mm")
                .precision(3)
                .display_limits(-10.0, 10.0)
                .alarm_limits(-8.0, 8.0),
        )?;
    }

    let context = QcaContext::new(Arc::new(ioc.clone()), Config::from_env());
    let mut event_loop = context.event_loop();
    let handle = event_loop.handle();
    let cancel = CancellationToken::new();

    let mut objects = Vec::new();
    for name in opts.names.iter().chain(opts.missing.iter()) {
        let object = QcaObject::new(name, &context, &handle);
        if let Err(e) = object.subscribe() {
            warn!("Could not subscribe to {name}: {e}");
        }

        let mut data = object.data_changed();
        let mut connection = object.connection_changed();
        let mut messages = object.user_messages();
        let name = name.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    Some(update) = data.recv() => match update.value {
                        Some(value) => println!("{name} {value} {}", update.alarm),
                        None => println!("{name} <no data> {}", update.alarm),
                    },
                    Some(info) = connection.recv() => println!("{name} {}", describe(&info)),
                    Some(message) = messages.recv() => match message.kind {
                        MessageKind::Warning => warn!("{message}"),
                        MessageKind::Error => tracing::error!("{message}"),
                    },
                    else => break,
                }
            }
        });
        objects.push(object);
    }

    // Drive the simulated values
    {
        let names = opts.names.clone();
        let stop = cancel.clone();
        let period = Duration::from_secs_f32(opts.period.max(0.01));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut step = 0u32;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => (),
                }
                step = step.wrapping_add(1);
                let value = 9.0 * (f64::from(step) / 5.0).sin();
                for name in &names {
                    if let Err(e) = ioc.set_value(name, value) {
                        warn!("Could not update {name}: {e}");
                    }
                }
            }
        });
    }

    {
        let stop = cancel.clone();
        let duration = Duration::from_secs_f32(opts.duration.max(0.0));
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            stop.cancel();
        });
    }

    if let Some(value) = opts.write
        && let Some(first) = objects.first()
    {
        // Issued once the channel connects
        if let Err(e) = first.write_data(value) {
            warn!("Could not write to {}: {e}", first.record_name());
        }
    }

    event_loop.run(cancel).await;
    drop(objects);
    info!("Finished.");
    Ok(())
}
