//! simple-secrets CLI — command dispatch over the store core.
//!
//! Usage:
//!   simple-secrets init
//!   simple-secrets put <key> <value> [--token <t>]
//!   simple-secrets get <key> [--token <t>]
//!   simple-secrets rotate-master-key [--token <t>]
//!   ...
//!
//! The token may also come from SIMPLE_SECRETS_TOKEN or config.json.

use std::process::ExitCode;
use std::sync::Arc;

use crate::auth::{AccessGate, Permission, Role};
use crate::backend::{Backend, HostFs};
use crate::config::{self, ConfigFile, Paths};
use crate::error::Result;
use crate::setup;
use crate::store::SecretStore;

type CmdResult = std::result::Result<(), Box<dyn std::error::Error>>;

pub fn run(args: Vec<String>) -> ExitCode {
    let Some(command) = args.get(1).map(String::as_str) else {
        print_usage();
        return ExitCode::from(1);
    };

    match command {
        "--help" | "-h" | "help" => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        "--version" | "-V" => {
            println!("simple-secrets {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        _ => {}
    }

    let parsed = match Args::parse(&args[2..]) {
        Ok(parsed) => parsed,
        Err(msg) => {
            eprintln!("error: {}", msg);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match dispatch(command, &parsed) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}: {}", operation_label(command), err);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!(
        r#"simple-secrets — encrypted secrets store

USAGE:
    simple-secrets <COMMAND> [ARGS] [--token <token>]

SECRETS:
    get <key>                 Decrypt and print a secret
    put <key> <value>         Store a secret (previous value is backed up)
    delete <key>              Remove a secret
    list                      List enabled secret keys
    list-disabled             List disabled secret keys
    disable <key>             Disable a secret without deleting it
    enable <key>              Re-enable a disabled secret

KEY ROTATION & BACKUPS:
    rotate-master-key         Re-encrypt everything under a fresh master key
    backup                    Take a manual snapshot of key + database
    list-backups              List rotation snapshots, newest first
    restore [<name>]          Restore key + database from a snapshot

USERS:
    init                      First-run setup; prints the admin token once
    create-user <name> --role <admin|reader>
    delete-user <name>
    update-role <name> --role <admin|reader>
    list-users
    rotate-token [--user <name>]

OPTIONS:
    --token <token>    Bearer token (else SIMPLE_SECRETS_TOKEN, else config.json)
    -h, --help         Print help
    -V, --version      Print version
"#
    );
}

fn operation_label(command: &str) -> &'static str {
    match command {
        "get" => "get secret",
        "put" => "put secret",
        "delete" => "delete secret",
        "list" => "list secrets",
        "list-disabled" => "list disabled secrets",
        "disable" => "disable secret",
        "enable" => "enable secret",
        "rotate-master-key" => "rotate master key",
        "backup" => "take snapshot",
        "list-backups" => "list backups",
        "restore" => "restore from backup",
        "init" => "initialize store",
        "create-user" => "create user",
        "delete-user" => "delete user",
        "update-role" => "update user role",
        "list-users" => "list users",
        "rotate-token" => "rotate token",
        _ => "run command",
    }
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

struct Args {
    positional: Vec<String>,
    token: Option<String>,
    user: Option<String>,
    role: Option<String>,
}

impl Args {
    fn parse(raw: &[String]) -> std::result::Result<Self, String> {
        let mut parsed = Args {
            positional: Vec::new(),
            token: None,
            user: None,
            role: None,
        };
        let mut i = 0;
        while i < raw.len() {
            match raw[i].as_str() {
                "--token" => {
                    i += 1;
                    parsed.token = Some(raw.get(i).ok_or("missing value for --token")?.clone());
                }
                "--user" => {
                    i += 1;
                    parsed.user = Some(raw.get(i).ok_or("missing value for --user")?.clone());
                }
                "--role" => {
                    i += 1;
                    parsed.role = Some(raw.get(i).ok_or("missing value for --role")?.clone());
                }
                flag if flag.starts_with("--") => {
                    return Err(format!("unknown option: {}", flag));
                }
                _ => parsed.positional.push(raw[i].clone()),
            }
            i += 1;
        }
        Ok(parsed)
    }

    fn positional(&self, index: usize, name: &str) -> std::result::Result<&str, String> {
        self.positional
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| format!("missing argument <{}>", name))
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

struct Context {
    backend: Arc<dyn Backend>,
    paths: Paths,
    config: ConfigFile,
}

impl Context {
    fn from_env() -> Result<Self> {
        let backend: Arc<dyn Backend> = Arc::new(HostFs::new());
        let paths = Paths::from_env()?;
        let config = ConfigFile::load(backend.as_ref(), &paths.config);
        Ok(Self {
            backend,
            paths,
            config,
        })
    }

    /// Authenticate the caller and check `permission` against their role.
    fn authorize(&self, args: &Args, permission: Permission) -> Result<(AccessGate, String)> {
        setup::require_installed(self.backend.as_ref(), &self.paths)?;
        let gate = AccessGate::load(self.paths.clone(), Arc::clone(&self.backend))?;
        let env_token = std::env::var(config::TOKEN_ENV).ok();
        let token = config::resolve_token(args.token.as_deref(), env_token.as_deref(), &self.config)?;
        let user = gate.require(&token, permission)?;
        Ok((gate, user.username))
    }

    fn open_store(&self) -> Result<SecretStore> {
        SecretStore::open(self.paths.clone(), Arc::clone(&self.backend))
    }
}

fn dispatch(command: &str, args: &Args) -> CmdResult {
    let ctx = Context::from_env()?;

    match command {
        "init" => {
            let token = setup::initialize(ctx.backend.as_ref(), &ctx.paths)?;
            eprintln!("Store initialized at {}", ctx.paths.root.display());
            eprintln!("Admin token (save it — it cannot be recovered):");
            println!("{}", token);
            Ok(())
        }

        // --- secrets ---
        "get" => {
            ctx.authorize(args, Permission::Read)?;
            let value = ctx.open_store()?.get(args.positional(0, "key")?)?;
            println!("{}", value);
            Ok(())
        }
        "put" => {
            ctx.authorize(args, Permission::Write)?;
            let key = args.positional(0, "key")?;
            ctx.open_store()?.put(key, args.positional(1, "value")?)?;
            eprintln!("Stored {}", key);
            Ok(())
        }
        "delete" => {
            ctx.authorize(args, Permission::Write)?;
            let key = args.positional(0, "key")?;
            ctx.open_store()?.delete(key)?;
            eprintln!("Deleted {}", key);
            Ok(())
        }
        "list" => {
            ctx.authorize(args, Permission::Read)?;
            for key in ctx.open_store()?.list_keys() {
                println!("{}", key);
            }
            Ok(())
        }
        "list-disabled" => {
            ctx.authorize(args, Permission::Read)?;
            for key in ctx.open_store()?.list_disabled() {
                println!("{}", key);
            }
            Ok(())
        }
        "disable" => {
            ctx.authorize(args, Permission::Write)?;
            let key = args.positional(0, "key")?;
            ctx.open_store()?.disable(key)?;
            eprintln!("Disabled {}", key);
            Ok(())
        }
        "enable" => {
            ctx.authorize(args, Permission::Write)?;
            let key = args.positional(0, "key")?;
            ctx.open_store()?.enable(key)?;
            eprintln!("Enabled {}", key);
            Ok(())
        }

        // --- rotation & backups ---
        "rotate-master-key" => {
            ctx.authorize(args, Permission::Write)?;
            let snapshot = ctx.open_store()?.rotate_master_key(None)?;
            eprintln!("Master key rotated; snapshot at {}", snapshot.display());
            Ok(())
        }
        "backup" => {
            ctx.authorize(args, Permission::Write)?;
            let snapshot = ctx.open_store()?.snapshot_now()?;
            eprintln!("Snapshot at {}", snapshot.display());
            Ok(())
        }
        "list-backups" => {
            ctx.authorize(args, Permission::Read)?;
            for backup in ctx.open_store()?.list_rotation_backups()? {
                let status = if backup.intact { "ok" } else { "incomplete" };
                println!("{}  {}", backup.name, status);
            }
            Ok(())
        }
        "restore" => {
            ctx.authorize(args, Permission::Write)?;
            let name = ctx
                .open_store()?
                .restore_from_backup(args.positional.first().map(String::as_str))?;
            eprintln!("Restored from {}", name);
            Ok(())
        }

        // --- users ---
        "create-user" => {
            let (gate, _) = ctx.authorize(args, Permission::ManageUsers)?;
            let username = args.positional(0, "username")?;
            let role = Role::parse(args.role.as_deref().ok_or("missing --role <admin|reader>")?)?;
            let token = gate.create_user(username, role)?;
            eprintln!("Created {} ({})", username, role);
            eprintln!("Token (save it — it cannot be recovered):");
            println!("{}", token);
            Ok(())
        }
        "delete-user" => {
            let (gate, _) = ctx.authorize(args, Permission::ManageUsers)?;
            let username = args.positional(0, "username")?;
            gate.delete_user(username)?;
            eprintln!("Deleted user {}", username);
            Ok(())
        }
        "update-role" => {
            let (gate, _) = ctx.authorize(args, Permission::ManageUsers)?;
            let username = args.positional(0, "username")?;
            let role = Role::parse(args.role.as_deref().ok_or("missing --role <admin|reader>")?)?;
            gate.update_role(username, role)?;
            eprintln!("Updated {} to {}", username, role);
            Ok(())
        }
        "list-users" => {
            let (gate, _) = ctx.authorize(args, Permission::ManageUsers)?;
            for (username, role, rotated_at) in gate.list_users() {
                match rotated_at {
                    Some(at) => println!("{}  {}  rotated {}", username, role, at.to_rfc3339()),
                    None => println!("{}  {}", username, role),
                }
            }
            Ok(())
        }
        "rotate-token" => {
            // Rotating someone else's token needs the admin permission;
            // rotating your own only needs rotate-own-token.
            let (gate, caller) = match &args.user {
                Some(_) => ctx.authorize(args, Permission::RotateTokens)?,
                None => ctx.authorize(args, Permission::RotateOwnToken)?,
            };
            let target = args.user.clone().unwrap_or(caller);
            let token = gate.rotate_token(&target)?;
            eprintln!("Rotated token for {}", target);
            eprintln!("Token (save it — it cannot be recovered):");
            println!("{}", token);
            Ok(())
        }

        other => Err(format!("unknown command: {}", other).into()),
    }
}
