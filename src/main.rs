use clap::Parser;
use just_build::build::{
    guess_parallelism, BuildConfig, Builder, DryRunCommandRunner, RealCommandRunner,
};
use just_build::fs::RealDisk;
use just_build::graph::{BuildError, NodeId, State};
use just_build::jobserver::Jobserver;
use just_build::logs::{build_log, deps_log, BuildLog, DepsLog};
use just_build::parser::ManifestParser;
use just_build::status::{StatusPrinter, Verbosity};
use just_build::tool::run_tool;

#[derive(Parser)]
#[command(name = "just-build")]
#[command(about = "A small, fast build tool that executes pre-generated build manifests")]
#[command(version)]
struct Cli {
    /// Manifest file to load
    #[arg(short = 'f', long = "file", default_value = "build.ninja")]
    file: String,

    /// Change to DIR before doing anything else
    #[arg(short = 'C', long = "directory")]
    directory: Option<String>,

    /// Run up to N jobs in parallel
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    /// Keep going until N jobs fail (0 means keep going regardless)
    #[arg(short = 'k', long = "keep-going", default_value_t = 1)]
    keep_going: usize,

    /// Dry run: report what would run without running anything
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Print full command lines while building
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Don't print a status line per edge
    #[arg(long = "quiet")]
    quiet: bool,

    /// Print the reason each edge is rebuilt
    #[arg(long = "explain")]
    explain: bool,

    /// Run a subtool instead of building: compdb, targets, query
    #[arg(short = 't', long = "tool")]
    tool: Option<String>,

    /// Targets to build (manifest defaults when omitted)
    #[arg()]
    targets: Vec<String>,
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let cli = Cli::parse();

    if let Some(dir) = &cli.directory {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("just-build: cannot chdir to '{}': {}", dir, e);
            return 2;
        }
    }

    let disk = RealDisk::new();
    let mut state = State::new();
    {
        let mut parser = ManifestParser::new(&mut state, &disk);
        if let Err(e) = parser.load(&cli.file) {
            eprintln!("just-build: error: {}", e);
            return 2;
        }
    }

    if let Some(tool) = &cli.tool {
        return match run_tool(&state, tool, &cli.targets) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("just-build: error: {}", e);
                2
            }
        };
    }

    // Logs live in the manifest's builddir when one is declared.
    let builddir = state
        .scopes
        .lookup(state.root_scope, "builddir")
        .map(str::to_string)
        .unwrap_or_default();
    let log_path = in_builddir(&builddir, ".ninja_log");
    let deps_path = in_builddir(&builddir, ".ninja_deps");

    let mut log = BuildLog::new();
    match log.load(&log_path) {
        Ok(build_log::LoadStatus::Recovered(warning)) => {
            eprintln!("just-build: warning: {}", warning)
        }
        Ok(_) => {}
        Err(e) => eprintln!("just-build: warning: loading {}: {}", log_path, e),
    }
    let mut deps = DepsLog::new();
    match deps.load(&deps_path, &mut state) {
        Ok(deps_log::LoadStatus::Recovered(warning)) => {
            eprintln!("just-build: warning: {}", warning)
        }
        Ok(_) => {}
        Err(e) => eprintln!("just-build: warning: loading {}: {}", deps_path, e),
    }

    let verbosity = if cli.quiet {
        Verbosity::Quiet
    } else if cli.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    };
    let config = BuildConfig {
        parallelism: cli.jobs.unwrap_or_else(guess_parallelism),
        failures_allowed: cli.keep_going,
        verbosity,
        dry_run: cli.dry_run,
        explain: cli.explain,
    };

    let targets: Vec<NodeId> = if !cli.targets.is_empty() {
        let mut nodes = Vec::new();
        for name in &cli.targets {
            match state.lookup_node(name) {
                Some(node) => nodes.push(node),
                None => {
                    eprintln!("just-build: error: unknown target '{}'", name);
                    return 1;
                }
            }
        }
        nodes
    } else if !state.defaults.is_empty() {
        state.defaults.clone()
    } else {
        state.root_nodes()
    };
    if targets.is_empty() {
        println!("just-build: no work to do.");
        return 0;
    }

    if !cli.dry_run {
        if deps.needs_recompaction() {
            if let Err(e) = deps.recompact(&deps_path, &mut state, |state, node| {
                state.node(node).in_edge.is_some()
            }) {
                eprintln!("just-build: warning: recompacting {}: {}", deps_path, e);
            }
        }
        if let Err(e) = log.open_for_write(&log_path) {
            eprintln!("just-build: error: opening {}: {}", log_path, e);
            return 1;
        }
        if let Err(e) = deps.open_for_write(&deps_path) {
            eprintln!("just-build: error: opening {}: {}", deps_path, e);
            return 1;
        }
    }

    let result = {
        let status = StatusPrinter::new(verbosity);
        let mut builder =
            Builder::new(&mut state, config.clone(), &disk, &mut log, &mut deps, status);
        let mut add_error = None;
        for &target in &targets {
            if let Err(e) = builder.add_target(target) {
                add_error = Some(e);
                break;
            }
        }
        match add_error {
            Some(e) => Err(e),
            None if builder.already_up_to_date() => {
                println!("just-build: no work to do.");
                Ok(())
            }
            None => {
                if cli.dry_run {
                    builder.build(&mut DryRunCommandRunner::new())
                } else {
                    match RealCommandRunner::new(config.parallelism, Jobserver::from_env()) {
                        Ok(mut runner) => builder.build(&mut runner),
                        Err(e) => Err(BuildError::Spawn(e.to_string())),
                    }
                }
            }
        }
    };

    deps.close();
    if let Err(e) = log.close(&log_path) {
        eprintln!("just-build: warning: closing {}: {}", log_path, e);
    }

    match result {
        Ok(()) => 0,
        Err(BuildError::Interrupted) => {
            eprintln!("just-build: interrupted by user");
            130
        }
        Err(e) => {
            eprintln!("just-build: error: {}", e);
            1
        }
    }
}

fn in_builddir(builddir: &str, file: &str) -> String {
    if builddir.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", builddir, file)
    }
}
