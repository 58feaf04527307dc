use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vidsight::config::Config;
use vidsight::db::VideoStatus;
use vidsight::logging::{self, LogTarget};
use vidsight::{Engine, ServiceError};

/// Interval between job status reads with `--wait`.
const WAIT_POLL: Duration = Duration::from_millis(250);

enum Command {
    AddVideo { path: PathBuf, duration: Option<f64> },
    AddReference { path: PathBuf, description: Option<String> },
    Videos { status: Option<VideoStatus> },
    References,
    Analyze { video_ids: Vec<i64> },
    Status { video_id: i64 },
    Job { job_id: i64, search: bool },
    Result { video_id: i64 },
    Persons { video_id: i64 },
    Search { reference_image_id: i64, video_ids: Vec<i64> },
    SearchResults { job_id: i64 },
    Cancel { job_id: i64, search: bool },
    DeleteVideo { video_id: i64 },
    DeleteReference { reference_image_id: i64 },
}

struct Cli {
    config_path: Option<PathBuf>,
    stderr_log: bool,
    wait: bool,
    command: Command,
}

fn fail_usage(message: &str) -> ! {
    eprintln!("Error: {}", message);
    eprintln!("Run 'vidsight --help' for usage.");
    std::process::exit(2);
}

fn parse_id(value: &str) -> i64 {
    value
        .parse()
        .unwrap_or_else(|_| fail_usage(&format!("'{}' is not a valid id", value)))
}

fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut stderr_log = false;
    let mut wait = false;
    let mut search = false;
    let mut duration = None;
    let mut description = None;
    let mut status = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("vidsight {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                let Some(path) = args.get(i + 1) else {
                    fail_usage("--config requires a path argument");
                };
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--duration" => {
                let Some(value) = args.get(i + 1) else {
                    fail_usage("--duration requires a number of seconds");
                };
                duration = Some(value.parse::<f64>().unwrap_or_else(|_| {
                    fail_usage(&format!("'{}' is not a valid duration", value))
                }));
                i += 1;
            }
            "--description" => {
                let Some(value) = args.get(i + 1) else {
                    fail_usage("--description requires a value");
                };
                description = Some(value.clone());
                i += 1;
            }
            "--status" => {
                let Some(value) = args.get(i + 1) else {
                    fail_usage("--status requires a value");
                };
                status = Some(VideoStatus::parse(value).unwrap_or_else(|| {
                    fail_usage(&format!("unknown video status '{}'", value))
                }));
                i += 1;
            }
            "--search" => search = true,
            "--wait" | "-w" => wait = true,
            "--stderr" => stderr_log = true,
            arg if arg.starts_with('-') && arg.len() > 1 => {
                fail_usage(&format!("unknown option {}", arg));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let Some((name, rest)) = positional.split_first() else {
        print_help();
        std::process::exit(2);
    };
    let one_id = |what: &str| -> i64 {
        match rest {
            [id] => parse_id(id),
            _ => fail_usage(&format!("{} expects exactly one {}", name, what)),
        }
    };
    let one_path = || -> PathBuf {
        match rest {
            [path] => PathBuf::from(path),
            _ => fail_usage(&format!("{} expects exactly one file path", name)),
        }
    };

    let command = match name.as_str() {
        "add-video" => Command::AddVideo {
            path: one_path(),
            duration,
        },
        "add-reference" => Command::AddReference {
            path: one_path(),
            description,
        },
        "videos" => Command::Videos { status },
        "references" => Command::References,
        "analyze" => Command::Analyze {
            video_ids: rest.iter().map(|id| parse_id(id)).collect(),
        },
        "status" => Command::Status {
            video_id: one_id("video id"),
        },
        "job" => Command::Job {
            job_id: one_id("job id"),
            search,
        },
        "result" => Command::Result {
            video_id: one_id("video id"),
        },
        "persons" => Command::Persons {
            video_id: one_id("video id"),
        },
        "search" => match rest.split_first() {
            Some((reference, videos)) => Command::Search {
                reference_image_id: parse_id(reference),
                video_ids: videos.iter().map(|id| parse_id(id)).collect(),
            },
            None => fail_usage("search expects a reference image id"),
        },
        "search-results" => Command::SearchResults {
            job_id: one_id("search job id"),
        },
        "cancel" => Command::Cancel {
            job_id: one_id("job id"),
            search,
        },
        "delete-video" => Command::DeleteVideo {
            video_id: one_id("video id"),
        },
        "delete-reference" => Command::DeleteReference {
            reference_image_id: one_id("reference image id"),
        },
        other => fail_usage(&format!("unknown command '{}'", other)),
    };

    Cli {
        config_path,
        stderr_log,
        wait,
        command,
    }
}

fn print_help() {
    println!(
        r#"vidsight - people analysis and reference-face search for videos

USAGE:
    vidsight [OPTIONS] <COMMAND> [ARGS]

COMMANDS:
    add-video <path> [--duration S]         Register a video
    add-reference <path> [--description D]  Register a reference image
    videos [--status S]                     List videos
    references                              List reference images
    analyze <video-id>...                   Start analysis (batch for several ids)
    status <video-id>                       Latest analysis job of a video
    job <job-id> [--search]                 Show an analysis (or search) job
    result <video-id>                       Latest completed analysis result
    persons <video-id>                      Persons of the latest completed analysis
    search <ref-id> [video-id...]           Search analyzed videos for a face
    search-results <job-id>                 Results of a search job
    cancel <job-id> [--search]              Cancel an analysis (or search) job
    delete-video <id>                       Delete a video and its results
    delete-reference <id>                   Delete a reference image and its searches

OPTIONS:
    --config, -c PATH   Path to config file
    --wait, -w          Print final job states once started jobs finish
    --stderr            Log to stderr instead of journald/file
    --version, -V       Show version
    --help, -h          Show this help message

Jobs run inside this process; the command returns once they are finished.

ENVIRONMENT:
    VIDSIGHT_CONFIG     Path to config file (overrides default location)
    VIDSIGHT_LOG        Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/vidsight/config.toml"#
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_upload(path: &Path) -> Result<(String, Vec<u8>)> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("{} has no usable file name", path.display()))?;
    Ok((name.to_string(), bytes))
}

/// Jobs started by the command, for `--wait`.
#[derive(Default)]
struct Started {
    analysis: Vec<i64>,
    search: Vec<i64>,
}

async fn run(engine: &Engine, command: Command, started: &mut Started) -> Result<()> {
    match command {
        Command::AddVideo { path, duration } => {
            let (name, bytes) = read_upload(&path)?;
            print_json(&engine.catalog.register_video(&name, &bytes, duration)?)
        }
        Command::AddReference { path, description } => {
            let (name, bytes) = read_upload(&path)?;
            print_json(&engine
                .catalog
                .register_reference_image(&name, &bytes, description)?)
        }
        Command::Videos { status } => print_json(&engine.catalog.list_videos(status)?),
        Command::References => print_json(&engine.catalog.list_reference_images()?),
        Command::Analyze { video_ids } => match video_ids.as_slice() {
            [video_id] => {
                let job = engine.analysis.start_analysis(*video_id)?;
                started.analysis.push(job.id);
                print_json(&job)
            }
            _ => {
                let outcome = engine.analysis.start_batch(&video_ids)?;
                started.analysis.extend(outcome.jobs.iter().map(|j| j.id));
                print_json(&outcome)
            }
        },
        Command::Status { video_id } => print_json(&engine.analysis.status_for_video(video_id)?),
        Command::Job { job_id, search } => {
            if search {
                print_json(&engine.search.job(job_id)?)
            } else {
                print_json(&engine.analysis.job(job_id)?)
            }
        }
        Command::Result { video_id } => print_json(&engine.analysis.result(video_id)?),
        Command::Persons { video_id } => print_json(&engine.analysis.persons(video_id)?),
        Command::Search {
            reference_image_id,
            video_ids,
        } => {
            let job = engine.search.search_person(reference_image_id, &video_ids)?;
            started.search.push(job.id);
            print_json(&job)
        }
        Command::SearchResults { job_id } => print_json(&engine.search.results(job_id)?),
        Command::Cancel { job_id, search } => {
            if search {
                print_json(&engine.search.cancel(job_id)?)
            } else {
                print_json(&engine.analysis.cancel(job_id)?)
            }
        }
        Command::DeleteVideo { video_id } => print_json(&engine.catalog.delete_video(video_id)?),
        Command::DeleteReference { reference_image_id } => {
            print_json(&engine.catalog.delete_reference_image(reference_image_id)?)
        }
    }
}

async fn wait_for(engine: &Engine, started: &Started) -> Result<()> {
    loop {
        let analysis = started
            .analysis
            .iter()
            .map(|&id| engine.analysis.job(id))
            .collect::<Result<Vec<_>, _>>()?;
        let search = started
            .search
            .iter()
            .map(|&id| engine.search.job(id))
            .collect::<Result<Vec<_>, _>>()?;

        let done = analysis.iter().all(|j| j.status.is_terminal())
            && search.iter().all(|j| j.status.is_terminal());
        if done {
            if !analysis.is_empty() {
                print_json(&analysis)?;
            }
            if !search.is_empty() {
                print_json(&search)?;
            }
            return Ok(());
        }
        tokio::time::sleep(WAIT_POLL).await;
    }
}

/// Prints a service error as JSON on stderr and picks the exit code.
fn report(err: &anyhow::Error) -> i32 {
    let Some(service) = err.downcast_ref::<ServiceError>() else {
        eprintln!("Error: {:#}", err);
        return 1;
    };
    if let ServiceError::Internal(source) = service {
        tracing::error!(error = %format!("{:#}", source), "Internal error");
    }
    let body = match service {
        ServiceError::Conflict { existing } => serde_json::json!({
            "error": service.code(),
            "message": service.to_string(),
            "existing_job": existing,
        }),
        _ => serde_json::json!({
            "error": service.code(),
            "message": service.to_string(),
        }),
    };
    eprintln!("{}", body);
    match service {
        ServiceError::Internal(_) => 1,
        _ => 3,
    }
}

#[tokio::main]
async fn main() {
    let cli = parse_args();

    let target = if cli.stderr_log {
        LogTarget::Stderr
    } else {
        LogTarget::System(Some(Config::config_dir().join("logs")))
    };
    let _ = logging::init(target);

    let code = match execute(cli).await {
        Ok(()) => 0,
        Err(e) => report(&e),
    };
    std::process::exit(code);
}

async fn execute(cli: Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let engine = Engine::open(&config)?;

    let mut started = Started::default();
    let outcome = run(&engine, cli.command, &mut started).await;
    let waited = match (&outcome, cli.wait) {
        (Ok(()), true) => wait_for(&engine, &started).await,
        _ => Ok(()),
    };

    // Queued jobs only run while this process is alive.
    engine.shutdown(false).await;
    outcome.and(waited)
}
