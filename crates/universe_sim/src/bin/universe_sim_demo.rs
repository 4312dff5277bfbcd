use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use chrono::{Duration, Utc};
use universe_sim::{
    bootstrap_events, ActionCatalog, Materializer, OpenAiChatOracle, OracleConfig, RunArtifact,
    SimConfig, SimKernel, SimRunner, SqliteBackend, TurnLogKind, UniverseState,
};

fn main() {
    let mut catalog_path: Option<PathBuf> = None;
    let mut universe_path: Option<PathBuf> = None;
    let mut artifact_path = PathBuf::from("run_artifact.json");
    let mut db_path: Option<PathBuf> = None;
    let mut schema_path: Option<PathBuf> = None;
    let mut replay_path: Option<PathBuf> = None;
    let mut turns: u64 = 20;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--catalog" => catalog_path = Some(PathBuf::from(value_of(&mut args, "--catalog"))),
            "--universe" => universe_path = Some(PathBuf::from(value_of(&mut args, "--universe"))),
            "--artifact" => artifact_path = PathBuf::from(value_of(&mut args, "--artifact")),
            "--db" => db_path = Some(PathBuf::from(value_of(&mut args, "--db"))),
            "--schema" => schema_path = Some(PathBuf::from(value_of(&mut args, "--schema"))),
            "--replay" => replay_path = Some(PathBuf::from(value_of(&mut args, "--replay"))),
            "--turns" => {
                let value = value_of(&mut args, "--turns");
                turns = value.parse().unwrap_or_else(|_| {
                    eprintln!("--turns expects a number, got {value}");
                    exit(2);
                });
            }
            "--help" | "-h" => {
                usage();
                return;
            }
            _ => {
                eprintln!("unknown argument: {arg}");
                usage();
                exit(2);
            }
        }
    }

    if let Some(path) = replay_path {
        let catalog_path = catalog_path.unwrap_or_else(|| {
            eprintln!("--replay needs --catalog for the write specs");
            usage();
            exit(2);
        });
        let db = db_path.unwrap_or_else(|| {
            eprintln!("--replay needs --db");
            usage();
            exit(2);
        });
        let catalog = load_catalog(&catalog_path);
        let artifact = RunArtifact::load_json(&path).unwrap_or_else(|err| {
            eprintln!("error: load artifact failed: {err:?}");
            exit(1);
        });
        println!(
            "replaying {} events from {}",
            artifact.events.len(),
            path.display()
        );
        materialize(&catalog, &artifact, &db, schema_path.as_deref());
        return;
    }

    let catalog_path = catalog_path.unwrap_or_else(|| {
        eprintln!("--catalog is required");
        usage();
        exit(2);
    });
    let universe_path = universe_path.unwrap_or_else(|| {
        eprintln!("--universe is required");
        usage();
        exit(2);
    });

    let catalog = load_catalog(&catalog_path);
    let universe = UniverseState::load_json(&universe_path).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        exit(1);
    });

    let config = OracleConfig::from_default_sources().unwrap_or_else(|err| {
        eprintln!("error: {err}");
        exit(1);
    });
    let oracle = OpenAiChatOracle::from_config(&config).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        exit(1);
    });

    let kernel = SimKernel::new(universe, catalog.clone(), SimConfig::default())
        .unwrap_or_else(|err| {
            eprintln!("error: {err}");
            exit(1);
        });
    for issue in kernel.seed_issues() {
        eprintln!("seed warning: {issue:?}");
    }

    let mut runner = SimRunner::new(kernel, oracle);
    let metrics = runner.run(turns);

    for entry in runner.logs() {
        if let TurnLogKind::TurnSkipped { reason } = &entry.kind {
            println!("turn {} skipped: {reason}", entry.turn);
        }
    }
    println!(
        "summary: {}/{} turns committed, {} spaces created, {} members joined",
        metrics.events_appended,
        metrics.turns_attempted,
        metrics.spaces_created,
        metrics.members_joined
    );

    let kernel = runner.into_kernel();
    let artifact = RunArtifact::new(kernel.universe().clone(), kernel.log().events().to_vec());
    if let Err(err) = artifact.save_json(&artifact_path) {
        eprintln!("error: save artifact failed: {err:?}");
        exit(1);
    }
    println!("artifact: {}", artifact_path.display());

    if let Some(db) = db_path {
        materialize(&catalog, &artifact, &db, schema_path.as_deref());
    }
}

fn value_of(args: &mut impl Iterator<Item = String>, flag: &str) -> String {
    match args.next() {
        Some(value) => value,
        None => {
            eprintln!("{flag} requires a value");
            usage();
            exit(2);
        }
    }
}

fn load_catalog(path: &Path) -> ActionCatalog {
    ActionCatalog::load_json(path).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        exit(1);
    })
}

fn materialize(catalog: &ActionCatalog, artifact: &RunArtifact, db: &Path, schema: Option<&Path>) {
    let mut backend = SqliteBackend::open(db).unwrap_or_else(|err| {
        eprintln!("error: {err}");
        exit(1);
    });
    if let Some(schema) = schema {
        let sql = fs::read_to_string(schema).unwrap_or_else(|err| {
            eprintln!("error: read schema failed: {err}");
            exit(1);
        });
        if let Err(err) = backend.connection().execute_batch(&sql) {
            eprintln!("error: apply schema failed: {err}");
            exit(1);
        }
    }

    // Bootstrap events are dated just before the first simulated event so the
    // base rows exist when the event writes reference them.
    let mut events = Vec::new();
    if let Some(bootstrap) = &catalog.bootstrap {
        let at = artifact
            .events
            .first()
            .map(|event| event.timestamp - Duration::seconds(1))
            .unwrap_or_else(Utc::now);
        events = bootstrap_events(&artifact.universe, bootstrap, at);
    }
    events.extend(artifact.events.iter().cloned());

    let mut materializer = Materializer::new(catalog);
    match materializer.run(&events, &mut backend) {
        Ok(report) => println!(
            "materialized: {} events, {} writes ({} writes skipped, {} events skipped)",
            report.events_processed,
            report.writes_executed,
            report.writes_skipped,
            report.events_skipped
        ),
        Err(err) => {
            eprintln!("error: {err}");
            exit(1);
        }
    }
}

fn usage() {
    println!(
        "universe_sim_demo --catalog <path> --universe <path> [--turns <n>] [--artifact <path>] [--db <path>] [--schema <path>]"
    );
    println!(
        "universe_sim_demo --replay <artifact> --catalog <path> --db <path> [--schema <path>]"
    );
}
