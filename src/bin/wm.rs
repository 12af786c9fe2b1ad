use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{debug, error};
use serde_json::Value;

use watermelon::error::{Error, Result};
use watermelon::host::backend::init_backends;
use watermelon::inventory::InvServer;
use watermelon::logging::{log_dir, Logging};
use watermelon::module::{exec_module, local, LifecycleManager};
use watermelon::session::ext::ValueFromExpander;
use watermelon::{server, session};

#[derive(Debug, Parser)]
#[clap(
    name = "wm",
    about = "Watermelon: imperative configuration automation engine."
)]
struct Cli {
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Inventory file (YAML).
    #[clap(short, long, global = true)]
    inv: Option<PathBuf>,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run a function in a module. Pass the module name, function name, and
    /// any additional args.
    Run {
        /// Directory containing modules. Repeat for each directory; the
        /// WM_MODULES environment variable is appended.
        #[clap(long = "mdir")]
        mdir: Vec<PathBuf>,

        /// Address to listen on for module dial-back.
        #[clap(long, default_value = "localhost:9876")]
        listen: String,

        /// Log directory.
        #[clap(long = "log", default_value = "./log")]
        logdir: PathBuf,

        /// Log to stdout as well.
        #[clap(long)]
        stdout: bool,

        /// Configuration file.
        #[clap(long = "cfg")]
        config: Option<PathBuf>,

        module: String,
        func: String,

        /// Arguments passed to the module function.
        #[clap(trailing_var_arg = true)]
        args: Vec<String>,
    },
    /// List available modules, or get a module description.
    Describe { module: Option<String> },
}

fn read_config(path: &Path) -> Result<Value> {
    let data = std::fs::read_to_string(path)?;
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_uppercase())
        .unwrap_or_default();
    match ext.as_str() {
        "YML" | "YAML" => {
            let v: serde_yaml::Value = serde_yaml::from_str(&data)?;
            Ok(serde_json::to_value(v)?)
        }
        "JSON" => Ok(serde_json::from_str(&data)?),
        _ => Err(Error::Config(format!("unrecognized extension: {}", ext))),
    }
}

/// Merges `src` into `dest`; `src` wins on conflicting leaves.
fn merge_config(dest: Value, src: Value) -> Value {
    match (dest, src) {
        (Value::Object(mut dest), Value::Object(src)) => {
            for (k, v) in src {
                let merged = match dest.remove(&k) {
                    Some(old) => merge_config(old, v),
                    None => v,
                };
                dest.insert(k, merged);
            }
            Value::Object(dest)
        }
        (_, src) => src,
    }
}

fn run(cli: Cli) -> Result<bool> {
    let Cmd::Run {
        mdir,
        listen,
        logdir,
        stdout,
        config,
        module,
        func,
        args,
    } = cli.command
    else {
        unreachable!("describe is handled in main");
    };

    let log_level = if cli.verbose { "debug" } else { "info" };
    debug!("initializing");

    init_backends();

    let file_cfg = match &config {
        Some(path) => Some(read_config(path)?),
        None => None,
    };

    let session = session::new_session();
    session.set_log_stdout(stdout);
    session.register_expander(Arc::new(ValueFromExpander));

    let (inv, inv_cfg) = match &cli.inv {
        Some(path) => {
            debug!("loading inventory {}", path.display());
            let (_cfg, hosts, inv_cfg) = watermelon::inventory::yml::load_inventory(path)?;
            debug!("there are {} hosts", hosts.len());
            (InvServer::new(hosts), inv_cfg)
        }
        None => (InvServer::new(Vec::new()), None),
    };
    session.set_inv(Arc::new(inv));

    session.set_config(match (file_cfg, inv_cfg) {
        (Some(f), Some(i)) => Some(merge_config(f, i)),
        (f, i) => f.or(i),
    });

    let logdir = log_dir(&logdir, &module);
    println!("Logs are under {}", logdir.display());
    std::fs::create_dir_all(&logdir)?;
    session.set_log(Logging::new(&logdir));

    let mut mgr = LifecycleManager::new();
    mgr.module_lookup_dirs = mdir;
    if mgr.module_lookup_dirs.is_empty() {
        mgr.module_lookup_dirs.push(PathBuf::from("."));
    }
    if let Some(extra) = std::env::var_os("WM_MODULES") {
        mgr.module_lookup_dirs.extend(std::env::split_paths(&extra));
    }
    debug!("module search dirs: {:?}", mgr.module_lookup_dirs);

    let listen_addr = listen.clone();
    mgr.run_module_script = Arc::new(move |first, dir| {
        let mode = if first { "buildrun" } else { "run" };
        debug!("calling {} first: {}", dir.display(), first);
        exec_module(
            "/bin/sh",
            &[
                "-c",
                &format!(
                    "cd {}; /bin/sh ./module.w {} {} --log {}",
                    dir.display(),
                    mode,
                    listen_addr,
                    log_level
                ),
            ],
        )
    });
    let mgr = Arc::new(mgr);
    session.set_modules(mgr.clone());

    let listener = std::net::TcpListener::bind(&listen)?;
    debug!("listening at {}", listen);
    server::spawn(listener, mgr.clone());
    // give the accept loop a chance to start
    std::thread::sleep(Duration::from_millis(100));

    session.set_args(args);
    debug!("calling {}.{}", module, func);
    let result = mgr.send_request(session.id(), &module, &func, &[]);
    debug!("result of main: {:?}", result);
    session.close();

    match result {
        Ok(rsp) => {
            if !rsp.success && !rsp.error_msg.is_empty() {
                error!("{}", rsp.error_msg);
            }
            Ok(rsp.success)
        }
        Err(e) => {
            error!("{}", e);
            Ok(false)
        }
    }
}

fn describe(module: Option<String>) {
    match module {
        None => {
            for (name, short) in local::describe_modules() {
                println!("{}\t{}", name, short);
            }
        }
        Some(name) => match local::get_module(&name) {
            Some(m) => print!("{}", m.help()),
            None => println!("Cannot find module {}", name),
        },
    }
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::new().parse_filters(level).try_init();

    match cli.command {
        Cmd::Describe { ref module } => {
            describe(module.clone());
        }
        Cmd::Run { .. } => match run(cli) {
            Ok(true) => {}
            Ok(false) => std::process::exit(1),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
    }
}
