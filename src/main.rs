// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kea-Roost: inventory-driven configuration management for the Kea ecosystem
//!
//! The same binary runs on the controller (encrypt, deploy, validate) and
//! on every node (apply).

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kea_roost::agesecrets::{AgeCliEngine, AgeEngine, RageEngine};
use kea_roost::config::{LoggingConfig, SITE_CONFIG_FILE};
use kea_roost::deploy::{resolve_targets, DeployAction, Deployer, SshTransport};
use kea_roost::inventory::{
    Collection, EncryptionRequest, ReferenceRegistry, SecretStore, CONTROLLER_ENTITY,
};
use kea_roost::localhost::Localhost;
use kea_roost::validate::validate;
use kea_roost::{roles, ApplyOptions, Site, SiteConfig};

/// Exit status when stdout is closed early, as by `roost list nodes | head -1`
const BROKEN_PIPE_EXIT_CODE: i32 = 129;

/// Kea-Roost: configuration management for a site of nodes
///
/// Resolves role arguments from the site inventory, decrypts age secrets
/// for the node being configured, and applies roles locally or over SSH.
#[derive(Parser, Debug)]
#[command(name = "roost")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Site directory (holds site.toml)
    #[arg(short, long, default_value = ".")]
    site: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (no changes to the local machine)
    #[arg(long)]
    dry_run: bool,

    /// Secret store arguments, e.g. `age_key=/path/to/key.age`
    #[arg(long, value_delimiter = ',')]
    secret_store_arguments: Vec<String>,

    /// Use the `age` and `age-keygen` binaries instead of the built-in engine
    #[arg(long)]
    age_binary: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Create a new site in the site directory
    Init {
        /// Site name; defaults to the directory name
        #[arg(long)]
        name: Option<String>,
    },

    /// Generate an age keypair
    Keygen {
        /// Where to write the private key
        path: PathBuf,
    },

    /// Apply a node's roles to this machine
    Apply {
        /// Node name
        node: String,

        /// Apply only these roles
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,

        /// Apply even if the node sets testing_do_not_apply
        #[arg(long)]
        force_apply: bool,

        /// Treat this directory as the filesystem root
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// List inventory items
    #[command(alias = "ls")]
    List {
        /// What to list
        #[arg(value_enum)]
        collection: ListCollection,
    },

    /// Show details about nodes, groups or functions
    Info {
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,

        #[arg(short, long, value_delimiter = ',')]
        groups: Vec<String>,

        #[arg(short, long, value_delimiter = ',')]
        functions: Vec<String>,
    },

    /// Encrypt a value for nodes, groups or the controller
    #[command(group(ArgGroup::new("input").required(true).args(["value", "file"])))]
    Encrypt {
        /// Encrypt this value
        #[arg(long)]
        value: Option<String>,

        /// Encrypt the contents of this file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Store the secret under this name
        #[arg(long)]
        save_as: Option<String>,

        /// Print the ciphertext
        #[arg(long)]
        stdout: bool,

        #[command(flatten)]
        recipients: Recipients,
    },

    /// Decrypt and print stored secrets
    Decrypt {
        #[command(flatten)]
        recipients: Recipients,
    },

    /// Copy the site to nodes and optionally apply it
    Deploy {
        #[command(subcommand)]
        action: DeployCommand,
    },

    /// Check the site for problems
    Validate,
}

#[derive(Subcommand, Debug)]
enum DeployCommand {
    /// Copy the site and run `roost apply` on each node
    Apply {
        #[command(flatten)]
        targets: Targets,

        /// Apply only these roles
        #[arg(long, value_delimiter = ',')]
        roles: Vec<String>,

        /// Apply even if a node sets testing_do_not_apply
        #[arg(long)]
        force_apply: bool,
    },

    /// Copy the site to each node without applying it
    Copy {
        #[command(flatten)]
        targets: Targets,
    },
}

#[derive(clap::Args, Debug)]
struct Recipients {
    /// Node names
    #[arg(short, long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Group names
    #[arg(short, long, value_delimiter = ',')]
    groups: Vec<String>,

    /// The controller
    #[arg(short, long)]
    controller: bool,
}

#[derive(clap::Args, Debug)]
struct Targets {
    /// Node names
    #[arg(short, long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Deploy to every member of these groups
    #[arg(short, long, value_delimiter = ',')]
    groups: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ListCollection {
    Nodes,
    Groups,
    Functions,
    Roles,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(&cli);

    match run(&cli).await {
        Err(e) if is_broken_pipe(&e) => std::process::exit(BROKEN_PIPE_EXIT_CODE),
        result => result,
    }
}

/// Pick the log filter from the flags, falling back to `[logging]` in the site
fn init_logging(cli: &Cli) {
    let logging = SiteConfig::from_file(cli.site.join(SITE_CONFIG_FILE))
        .map(|config| config.logging)
        .unwrap_or_default();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::new(&logging.level)
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(io::stderr);

    if is_json(&logging) {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn is_json(logging: &LoggingConfig) -> bool {
    logging.format.eq_ignore_ascii_case("json")
}

fn is_broken_pipe(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|err| err.kind() == io::ErrorKind::BrokenPipe)
    })
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Version => show_version(&cli.site),

        Commands::Init { name } => init_site(&cli.site, name.as_deref(), engine(cli).as_ref()),

        Commands::Keygen { path } => keygen(path, engine(cli).as_ref()),

        Commands::Apply {
            node,
            roles,
            force_apply,
            root,
        } => {
            let mut site = load_site(cli)?;
            let options = ApplyOptions {
                roles: roles.clone(),
                force: *force_apply,
            };
            let mut localhost = Localhost::new().with_dry_run(cli.dry_run);
            if let Some(root) = root {
                localhost = localhost.with_root(root);
            }
            apply_node(&mut site, node, &options, &localhost).await
        }

        Commands::List { collection } => list(&load_site(cli)?, *collection),

        Commands::Info {
            nodes,
            groups,
            functions,
        } => show_info(&load_site(cli)?, nodes, groups, functions),

        Commands::Encrypt {
            value,
            file,
            save_as,
            stdout,
            recipients,
        } => {
            let site = load_site(cli)?;
            let value = match (value, file) {
                (Some(value), _) => value.clone(),
                (None, Some(file)) => std::fs::read_to_string(file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                (None, None) => anyhow::bail!("Pass one of --value or --file"),
            };
            encrypt(&site, value, save_as.as_deref(), *stdout, recipients)
        }

        Commands::Decrypt { recipients } => decrypt(&load_site(cli)?, recipients),

        Commands::Deploy { action } => deploy(&load_site(cli)?, action).await,

        Commands::Validate => validate_site(&load_site(cli)?),
    }
}

fn engine(cli: &Cli) -> Arc<dyn AgeEngine> {
    if cli.age_binary {
        Arc::new(AgeCliEngine::new())
    } else {
        Arc::new(RageEngine::new())
    }
}

/// Load the site and apply `--secret-store-arguments`
fn load_site(cli: &Cli) -> anyhow::Result<Site> {
    let mut site = Site::load_with(
        &cli.site,
        roles::builtin(),
        ReferenceRegistry::builtin(),
        engine(cli),
    )
    .with_context(|| format!("Failed to load site from {}", cli.site.display()))?;

    let arguments = parse_secret_store_arguments(&cli.secret_store_arguments)?;
    site.apply_secret_store_arguments(&arguments)?;
    Ok(site)
}

fn parse_secret_store_arguments(raw: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => anyhow::bail!("Secret store argument '{}' is not key=value", pair),
        })
        .collect()
}

fn show_version(site_dir: &Path) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "Kea-Roost v{}", env!("CARGO_PKG_VERSION"))?;
    writeln!(out, "Inventory-driven configuration management for the Kea Ecosystem")?;

    let config_path = site_dir.join(SITE_CONFIG_FILE);
    if config_path.exists() {
        let config = SiteConfig::from_file(&config_path)?;
        writeln!(out)?;
        writeln!(out, "Site: {}", config.name)?;
        if !config.description.is_empty() {
            writeln!(out, "  {}", config.description)?;
        }
    }
    Ok(())
}

fn init_site(site_dir: &Path, name: Option<&str>, engine: &dyn AgeEngine) -> anyhow::Result<()> {
    let name = match name {
        Some(name) => name.to_string(),
        None => site_dir
            .canonicalize()
            .ok()
            .and_then(|path| path.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_else(|| "site".to_string()),
    };

    let node_key = Site::init(site_dir, &name, engine)
        .with_context(|| format!("Failed to create site in {}", site_dir.display()))?;
    let node_key_path = site_dir.join("example.age");
    node_key.write_to(&node_key_path)?;

    info!(site = %name, "Created site");
    let mut out = io::stdout().lock();
    writeln!(out, "Created site '{}' in {}", name, site_dir.display())?;
    writeln!(out)?;
    writeln!(out, "  Controller key: {}", site_dir.join("controller.age").display())?;
    writeln!(out, "  Example node key: {}", node_key_path.display())?;
    writeln!(out)?;
    writeln!(
        out,
        "Install the example node key on the node and remove it from the site directory."
    )?;
    Ok(())
}

fn keygen(path: &Path, engine: &dyn AgeEngine) -> anyhow::Result<()> {
    let key = engine.generate_keypair()?;
    key.write_to(path)
        .with_context(|| format!("Failed to write key to {}", path.display()))?;

    let mut out = io::stdout().lock();
    writeln!(out, "Wrote private key to {}", path.display())?;
    writeln!(out, "Public key: {}", key.public)?;
    Ok(())
}

async fn apply_node(
    site: &mut Site,
    node: &str,
    options: &ApplyOptions,
    localhost: &Localhost,
) -> anyhow::Result<()> {
    if localhost.is_dry_run() {
        writeln!(io::stdout(), "[DRY RUN] Applying node {}", node)?;
    }

    let applied = site
        .apply(node, options, localhost)
        .await
        .with_context(|| format!("Failed to apply node {}", node))?;

    let mut out = io::stdout().lock();
    for role in &applied {
        writeln!(out, "  applied {}", role)?;
    }
    writeln!(out, "Applied {} role(s) to {}", applied.len(), node)?;
    Ok(())
}

fn list(site: &Site, collection: ListCollection) -> anyhow::Result<()> {
    let hosts = site.hosts();
    let names: Vec<&str> = match collection {
        ListCollection::Nodes => hosts.nodes().collect(),
        ListCollection::Groups => hosts.groups(),
        ListCollection::Functions => hosts.functions().collect(),
        ListCollection::Roles => hosts.roles().collect(),
    };

    let mut out = io::stdout().lock();
    for name in names {
        writeln!(out, "{}", name)?;
    }
    Ok(())
}

fn show_info(
    site: &Site,
    nodes: &[String],
    groups: &[String],
    functions: &[String],
) -> anyhow::Result<()> {
    let hosts = site.hosts();
    let mut out = io::stdout().lock();

    if nodes.is_empty() && groups.is_empty() && functions.is_empty() {
        writeln!(
            out,
            "Request info on a node, group or function. (See also the 'list' subcommand.)"
        )?;
    }

    for node in nodes {
        let function = hosts.node_function(node)?;
        writeln!(out, "Node {} (function {}):", node, function)?;
        writeln!(out, "  Groups: {}", hosts.node_groups(node)?.join(", "))?;
        writeln!(out, "  Roles: {}", hosts.node_rolename_list(node)?.join(", "))?;
    }
    for group in groups {
        writeln!(out, "Group {}:", group)?;
        writeln!(out, "  Members: {}", hosts.group_members(group)?.join(", "))?;
    }
    for function in functions {
        let roles = hosts
            .topology()
            .function_roles
            .get(function)
            .with_context(|| format!("Unknown function '{}'", function))?;
        writeln!(out, "Function {}:", function)?;
        writeln!(out, "  Nodes: {}", hosts.function_nodes(function).join(", "))?;
        writeln!(out, "  Roles: {}", roles.join(", "))?;
    }
    Ok(())
}

fn encrypt(
    site: &Site,
    value: String,
    save_as: Option<&str>,
    stdout: bool,
    recipients: &Recipients,
) -> anyhow::Result<()> {
    if recipients.nodes.is_empty() && recipients.groups.is_empty() && !recipients.controller {
        anyhow::bail!("Pass at least one of --nodes, --groups or --controller");
    }

    let request = EncryptionRequest {
        name: save_as.unwrap_or_default().to_string(),
        value,
        nodes: recipients.nodes.clone(),
        groups: recipients.groups.clone(),
        controller_key: recipients.controller,
        store: save_as.is_some(),
    };
    let ciphertext = site.secrets().encrypt_secret(site.hosts(), &request)?;

    let mut out = io::stdout().lock();
    if let Some(name) = save_as {
        writeln!(out, "Saved secret '{}'", name)?;
    }
    if stdout || save_as.is_none() {
        write!(out, "{}", ciphertext)?;
        if !ciphertext.ends_with('\n') {
            writeln!(out)?;
        }
    }
    Ok(())
}

fn decrypt(site: &Site, recipients: &Recipients) -> anyhow::Result<()> {
    if recipients.nodes.is_empty() && recipients.groups.is_empty() && !recipients.controller {
        anyhow::bail!("Pass at least one of --nodes, --groups or --controller");
    }
    if site.secrets().decryption_key().is_none() {
        anyhow::bail!("No decryption key found; pass --secret-store-arguments age_key=PATH");
    }

    let mut entities: Vec<(Collection, &str, String)> = Vec::new();
    for node in &recipients.nodes {
        entities.push((Collection::Node, node.as_str(), format!("node {}", node)));
    }
    for group in &recipients.groups {
        entities.push((Collection::Group, group.as_str(), format!("group {}", group)));
    }
    if recipients.controller {
        entities.push((
            Collection::Special,
            CONTROLLER_ENTITY,
            "the controller".to_string(),
        ));
    }

    let mut out = io::stdout().lock();
    for (collection, entity, label) in entities {
        let mut decrypted = Map::new();
        for name in site.secrets().list_secrets(collection, entity)? {
            let secret = site.secrets().get_secret(collection, entity, &name)?;
            let plaintext = secret
                .decrypt()
                .with_context(|| format!("Failed to decrypt '{}' for {}", name, label))?;
            decrypted.insert(name, Value::String(plaintext));
        }
        writeln!(out, "Secrets for {}:", label)?;
        writeln!(out, "---")?;
        writeln!(out, "{}", serde_json::to_string_pretty(&Value::Object(decrypted))?)?;
        writeln!(out, "---")?;
    }
    Ok(())
}

async fn deploy(site: &Site, command: &DeployCommand) -> anyhow::Result<()> {
    let (targets, action) = match command {
        DeployCommand::Apply {
            targets,
            roles,
            force_apply,
        } => (
            targets,
            DeployAction::Apply {
                roles: roles.clone(),
                force: *force_apply,
            },
        ),
        DeployCommand::Copy { targets } => (targets, DeployAction::Copy),
    };

    let targets = resolve_targets(site.hosts(), &targets.nodes, &targets.groups)?;
    let deploy_config = site.config().deploy.clone();
    let transport = SshTransport::new(deploy_config.ssh_options.clone());
    let deployer = Deployer::new(transport, deploy_config, site.deploy_sources());

    let report = deployer.deploy(&targets, &action).await;

    let mut out = io::stdout().lock();
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(output) => {
                writeln!(out, "[ok] {} ({} ms)", outcome.node, outcome.duration_ms)?;
                for line in output.lines() {
                    writeln!(out, "  {}", line)?;
                }
            }
            Err(message) => {
                writeln!(out, "[failed] {}: {}", outcome.node, message)?;
            }
        }
    }

    let failed = report.failed().count();
    if failed > 0 {
        error!(failed, "Deployment failed on some nodes");
        anyhow::bail!("Deployment failed on {} of {} node(s)", failed, report.outcomes.len());
    }

    match action {
        DeployAction::Copy => writeln!(
            out,
            "Copied to {} node(s) at {}",
            report.outcomes.len(),
            site.config().deploy.remote_path
        )?,
        DeployAction::Apply { .. } => {
            writeln!(out, "Applied to {} node(s)", report.outcomes.len())?
        }
    }
    Ok(())
}

fn validate_site(site: &Site) -> anyhow::Result<()> {
    let report = validate(site);

    let mut out = io::stdout().lock();
    for issue in &report.issues {
        writeln!(out, "{}", issue)?;
    }

    if !report.is_valid() {
        anyhow::bail!(
            "Site '{}' has {} error(s)",
            site.config().name,
            report.errors().count()
        );
    }

    writeln!(out, "Site '{}' is valid", site.config().name)?;
    Ok(())
}
