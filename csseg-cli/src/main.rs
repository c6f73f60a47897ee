//! csseg CLI: runs a continual segmentation task sequence.
//!
//! Launch one process per device with the same configuration file and a
//! distinct `--local_rank`; rank 0 writes checkpoints and the JSON log.

use std::path::{Path, PathBuf};

use clap::Parser;
use csseg_core::{Backend, DistributedCoordinator, RunnerConfig, TaskSequenceController};
use tracing::{Subscriber, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Continual semantic segmentation trainer
#[derive(Parser, Debug)]
#[command(name = "csseg", version, about, long_about = None)]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(long = "cfgfilepath")]
    cfgfilepath: PathBuf,

    /// Rank of this process
    #[arg(long = "local_rank", default_value_t = 0)]
    local_rank: usize,

    /// Number of processes taking part in the run
    #[arg(long = "nproc_per_node", default_value_t = 2)]
    nproc_per_node: usize,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The file layer needs the configuration, so stderr alone covers loading it.
    let config = {
        let stderr_only = tracing_subscriber::registry().with(stderr_layer(&cli));
        let _guard = tracing::subscriber::set_default(stderr_only);
        load_config_logged(&cli.cfgfilepath)?
    };
    let world_size = match config.parallel.backend {
        Backend::Single => 1,
        Backend::Tcp => cli.nproc_per_node,
    };
    let leader = cli.local_rank == 0;

    // Human-readable stderr; the JSON file layer only on the leader.
    let (json_layer, _guard) = if leader {
        let (dir, name) = split_log_path(&config.log_file());
        std::fs::create_dir_all(&dir)?;
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_filter(EnvFilter::new("debug"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(stderr_layer(&cli))
        .with(json_layer)
        .init();

    if config.parallel.backend == Backend::Single && cli.nproc_per_node > 1 && leader {
        warn!(
            nproc_per_node = cli.nproc_per_node,
            "Backend 'single' runs one process; ignoring --nproc_per_node"
        );
    }

    if let Err(e) = run(config, cli.local_rank, world_size) {
        if leader {
            error!(error = %e, "Training aborted");
        }
        return Err(e);
    }
    Ok(())
}

fn stderr_layer<S>(cli: &Cli) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(cli.filter()))
}

fn load_config_logged(path: &Path) -> anyhow::Result<RunnerConfig> {
    csseg_core::load_config(path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Configuration error");
        anyhow::anyhow!("Configuration error: {e}")
    })
}

fn run(config: RunnerConfig, rank: usize, world_size: usize) -> anyhow::Result<()> {
    let coordinator = DistributedCoordinator::init(&config.parallel, rank, world_size)?;
    if coordinator.is_leader() {
        info!(
            algorithm = %config.algorithm,
            task_name = %config.task_name,
            num_tasks = config.num_tasks,
            world_size,
            work_dir = %config.work_dir.display(),
            "Starting task sequence"
        );
    }
    let controller = TaskSequenceController::from_config(config, coordinator.clone())?;
    let summaries = controller.run()?;
    if coordinator.is_leader() {
        for summary in &summaries {
            info!(
                task_id = summary.task_id,
                known_classes = summary.known_classes,
                best_score = summary.best_score,
                epochs_run = summary.epochs_run,
                "Task summary"
            );
        }
    }
    Ok(())
}

fn split_log_path(path: &Path) -> (PathBuf, PathBuf) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let name = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("train.log"));
    (dir, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["csseg", "--cfgfilepath", "run.toml"]).unwrap();
        assert_eq!(cli.cfgfilepath, PathBuf::from("run.toml"));
        assert_eq!(cli.local_rank, 0);
        assert_eq!(cli.nproc_per_node, 2);
        assert_eq!(cli.filter(), "info");
    }

    #[test]
    fn test_cli_requires_config() {
        assert!(Cli::try_parse_from(["csseg"]).is_err());
    }

    #[test]
    fn test_cli_verbosity() {
        let cli = Cli::try_parse_from([
            "csseg",
            "--cfgfilepath",
            "a.json",
            "-vv",
            "--local_rank",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.filter(), "trace");
        assert_eq!(cli.local_rank, 3);
        let cli = Cli::try_parse_from(["csseg", "--cfgfilepath", "a.json", "--quiet"]).unwrap();
        assert_eq!(cli.filter(), "error");
    }

    #[test]
    fn test_config_error_is_logged() {
        let logs = LogBuffer::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, || {
            load_config_logged(Path::new("/nonexistent/csseg.toml"))
        });

        let err = result.unwrap_err();
        assert!(err.to_string().starts_with("Configuration error"));
        let logged = String::from_utf8_lossy(&logs.0.lock().unwrap()).into_owned();
        assert!(logged.contains("ERROR"));
        assert!(logged.contains("/nonexistent/csseg.toml"));
    }

    #[test]
    fn test_split_log_path() {
        assert_eq!(
            split_log_path(Path::new("work/train.log")),
            (PathBuf::from("work"), PathBuf::from("train.log"))
        );
        assert_eq!(
            split_log_path(Path::new("train.log")),
            (PathBuf::from("."), PathBuf::from("train.log"))
        );
    }
}
