use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use portage_repo::{
    Level, MatchEngine, Md5CacheExtractor, MetadataStore, RepositorySet, Settings,
    VisibilityFilter,
};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: query_tree <repository> <atom> [level] [keyword...]";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let (Some(repo), Some(dep)) = (args.next(), args.next()) else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let level: Level = match args.next().as_deref().unwrap_or("match-all").parse() {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let mut keywords: Vec<String> = args.collect();
    if keywords.is_empty() {
        keywords.push("amd64".to_string());
    }

    let repos = RepositorySet::new(Path::new(&repo), Vec::<PathBuf>::new());
    let settings = Settings {
        accept_keywords: keywords,
        license_groups: repos.license_groups(),
        depcachedir: env::temp_dir().join("query_tree-dep"),
        ..Settings::default()
    };
    let store = MetadataStore::new(repos, &settings, Box::new(Md5CacheExtractor));
    let mut engine = MatchEngine::new(store, VisibilityFilter::new(settings));

    let found = if level.takes_list() {
        engine
            .xmatch(Level::MatchAll, &dep)
            .and_then(|all| engine.xmatch_list(level, &dep, &all))
    } else {
        engine.xmatch(level, &dep)
    };
    let code = match found {
        Ok(found) => {
            println!("=== {level} {dep} ===");
            for cpv in &found {
                match engine.store_mut().aux_get(cpv, &["SLOT", "KEYWORDS"], None) {
                    Ok(values) => println!("{cpv}  SLOT={}  KEYWORDS={}", values[0], values[1]),
                    Err(err) => println!("{cpv}  ({err})"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    };

    if let Err(err) = engine.close_caches() {
        eprintln!("{err}");
    }
    code
}
