use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use firehose_consumer::logging::{self, LogConfig, LogLevel};
use firehose_consumer::{
    Consumer, ConsumerConfig, ConsumerError, Envelope, Event, LogMessage, MessageType,
    TracingDebugPrinter,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "firehose-tail", about = "Tail traffic controller event streams")]
struct Cli {
    #[arg(long, env = "FIREHOSE_URL", value_name = "URL", help = "Traffic controller base url (ws:// or wss://)")]
    url: String,

    #[arg(
        long,
        env = "FIREHOSE_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Value sent verbatim as the Authorization header"
    )]
    token: String,

    #[arg(long, help = "Give up after the first failure instead of reconnecting")]
    no_reconnect: bool,

    #[arg(
        long,
        env = "FIREHOSE_IDLE_TIMEOUT_SECS",
        value_name = "SECS",
        help = "Fail a read when no frame arrives for this many seconds (0 disables)"
    )]
    idle_timeout: Option<u64>,

    #[arg(
        long,
        env = "FIREHOSE_RECONNECT_DELAY_MS",
        value_name = "MILLIS",
        help = "Pause between a failed attempt and the next one"
    )]
    reconnect_delay_ms: Option<u64>,

    #[arg(long, help = "Log the upgrade request and response at debug level")]
    trace_http: bool,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(self.url.clone());
        config.idle_timeout = self
            .idle_timeout
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        if let Some(millis) = self.reconnect_delay_ms {
            config.reconnect_delay = Duration::from_millis(millis);
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "FIREHOSE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "FIREHOSE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tail log messages of one app
    Logs { app_id: String },
    /// Stream every event of one app
    Stream { app_id: String },
    /// Stream the platform firehose under a subscription id
    Firehose { subscription_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initialize logging")?;

    let mut builder = cli.consumer_config().into_builder().on_connect(|| {
        info!(target = "firehose.tail", "connected");
    });
    if cli.trace_http {
        builder = builder.debug_printer(TracingDebugPrinter);
    }
    let consumer = builder.build();

    match &cli.command {
        Command::Logs { app_id } => {
            let (events, errors) = if cli.no_reconnect {
                consumer.tailing_logs_without_reconnect(app_id, &cli.token)
            } else {
                consumer.tailing_logs(app_id, &cli.token)
            };
            run(&consumer, events, errors, format_log).await
        }
        Command::Stream { app_id } => {
            let (events, errors) = if cli.no_reconnect {
                consumer.stream_without_reconnect(app_id, &cli.token)
            } else {
                consumer.stream(app_id, &cli.token)
            };
            run(&consumer, events, errors, format_envelope).await
        }
        Command::Firehose { subscription_id } => {
            let (events, errors) = if cli.no_reconnect {
                consumer.firehose_without_reconnect(subscription_id, &cli.token)
            } else {
                consumer.firehose(subscription_id, &cli.token)
            };
            run(&consumer, events, errors, format_envelope).await
        }
    }
}

/// Prints events until the stream ends. Ctrl-C terminates the consumer and
/// lets the receivers drain.
async fn run<T, F>(
    consumer: &Consumer,
    mut events: mpsc::Receiver<T>,
    mut errors: mpsc::Receiver<ConsumerError>,
    format: F,
) -> Result<()>
where
    F: Fn(&T) -> String,
{
    let reporter = tokio::spawn(async move {
        let mut failures = 0usize;
        while let Some(err) = errors.recv().await {
            failures += 1;
            warn!(target = "firehose.tail", error = %err, "stream error");
        }
        failures
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut terminating = false;

    loop {
        tokio::select! {
            signal = &mut ctrl_c, if !terminating => {
                signal.context("listen for ctrl-c")?;
                terminating = true;
                if let Err(err) = consumer.terminate().await {
                    warn!(target = "firehose.tail", error = %err, "terminate failed");
                }
            }
            event = events.recv() => match event {
                Some(event) => println!("{}", format(&event)),
                None => break,
            },
        }
    }

    let failures = reporter.await.context("join error reporter")?;
    if failures > 0 && !terminating {
        anyhow::bail!("stream ended after {failures} error(s)");
    }
    Ok(())
}

fn format_log(message: &LogMessage) -> String {
    let stream = match message.message_type {
        MessageType::Out => "OUT",
        MessageType::Err => "ERR",
    };
    format!(
        "{} [{}/{}] {} {}",
        message.timestamp,
        message.source_type,
        message.source_instance,
        stream,
        String::from_utf8_lossy(&message.message)
    )
}

fn format_envelope(envelope: &Envelope) -> String {
    let detail = match &envelope.event {
        Event::LogMessage(message) => format_log(message),
        Event::ValueMetric(metric) => format!("{} = {} {}", metric.name, metric.value, metric.unit),
        Event::CounterEvent(counter) => {
            format!("{} +{} (total {})", counter.name, counter.delta, counter.total)
        }
        Event::Error(error) => format!("{} {}: {}", error.source, error.code, error.message),
        Event::ContainerMetric(metric) => format!(
            "{}[{}] cpu={:.2}% mem={}B disk={}B",
            metric.app_id,
            metric.instance_index,
            metric.cpu_percentage,
            metric.memory_bytes,
            metric.disk_bytes
        ),
    };
    format!("{} {} {}", envelope.origin, envelope.event_type(), detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_consumer::DEFAULT_RECONNECT_DELAY;

    fn parse(args: &[&str]) -> Cli {
        let base = ["firehose-tail", "--url", "ws://127.0.0.1:9911", "--token", "bearer abc"];
        Cli::try_parse_from(base.iter().chain(args.iter()).copied()).expect("valid arguments")
    }

    #[test]
    fn reconnect_delay_and_idle_timeout_reach_the_config() {
        let cli = parse(&["--reconnect-delay-ms", "25", "--idle-timeout", "30", "firehose", "sub-1"]);
        let config = cli.consumer_config();
        assert_eq!(config.url, "ws://127.0.0.1:9911");
        assert_eq!(config.reconnect_delay, Duration::from_millis(25));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert!(matches!(cli.command, Command::Firehose { ref subscription_id } if subscription_id == "sub-1"));
    }

    #[test]
    fn defaults_when_flags_are_absent() {
        let config = parse(&["--idle-timeout", "0", "logs", "app-1"]).consumer_config();
        assert_eq!(config.reconnect_delay, DEFAULT_RECONNECT_DELAY);
        assert_eq!(config.idle_timeout, None);
    }
}
