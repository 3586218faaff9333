use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use comply_apply::{aws, infra, reconcile, ReconcileCtx};
use comply_core::{
    config, CertificateRef, DeploymentTarget, IacEngine, IngressShape, InputProvider,
    InstallError, Platform, ReconcileAction, TlsSource,
};
use comply_plan::{
    plan, resolve_install_type, AssumeDefaults, PlanInput, PlanOptions, TerminalInput,
    INGRESS_NGINX_NAMESPACE, INGRESS_NGINX_SERVICE, ISSUER_NAME,
};
use comply_wait::WaitOutcome;

mod report;
use report::Access;

#[derive(Parser, Debug)]
#[command(name = "complyctl", version, about = "OpenComply deployment orchestrator")]
struct Cli {
    /// Target namespace (default: opencomply)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Verbose logging (also enables the chart's debug mode on install)
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install OpenComply onto the current cluster (provisioning infra first on AWS)
    Install(InstallArgs),
    /// Remove the OpenComply release, optionally destroying provisioned infra
    Uninstall {
        /// Also destroy the infrastructure stack (asks again before acting)
        #[arg(long, action = ArgAction::SetTrue)]
        destroy_infra: bool,
        /// Answer yes to non-destructive confirmations
        #[arg(short = 'y', long, action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// Show cluster suitability and release status
    Status,
    /// Deploy the AWS organization bootstrap stack (read-only audit access)
    Bootstrap {
        #[arg(long, default_value = "OpenComplyReadOnlyUser")]
        username: String,
        #[arg(long, default_value = "OpenComplyReadOnly")]
        role_name: String,
        /// Organization unit ids, comma separated
        #[arg(long, value_delimiter = ',')]
        org_units: Vec<String>,
        #[arg(long, default_value = "opencomply-bootstrap")]
        stack_name: String,
    },
}

#[derive(Args, Debug)]
struct InstallArgs {
    /// Custom domain for the app (enables the ingress paths)
    #[arg(short = 'd', long)]
    domain: Option<String>,

    /// Contact email for ACME certificate issuance
    #[arg(short = 'm', long)]
    email: Option<String>,

    /// Install type: 1 = HTTPS ingress, 2 = basic (port-forward)
    #[arg(short = 't', long = "type", value_parser = clap::value_parser!(u8).range(1..=2))]
    install_type: Option<u8>,

    /// Cloud region for infrastructure provisioning
    #[arg(short = 'r', long)]
    region: Option<String>,

    #[arg(long, value_enum, default_value_t = PlatformArg::Auto)]
    platform: PlatformArg,

    /// Reuse existing infrastructure state instead of provisioning
    #[arg(long, action = ArgAction::SetTrue)]
    use_existing: bool,

    /// Re-apply resources even when live objects already match
    #[arg(long, action = ArgAction::SetTrue)]
    always_apply: bool,

    /// Answer yes to non-destructive confirmations (non-interactive)
    #[arg(short = 'y', long, action = ArgAction::SetTrue)]
    yes: bool,

    /// Upgrade an existing release in place
    #[arg(long, action = ArgAction::SetTrue)]
    upgrade: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PlatformArg {
    Auto,
    Aws,
    Digitalocean,
    Generic,
}

fn init_tracing(debug: bool) {
    let env = std::env::var("COMPLY_LOG")
        .unwrap_or_else(|_| if debug { "debug".to_string() } else { "info".to_string() });
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(filter);

    // Persistent log with timestamps and the delegated tools' debug output.
    let file_layer = open_log_file().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG)
    });

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

fn open_log_file() -> Option<std::fs::File> {
    let dir = std::env::var("COMPLY_LOG_DIR")
        .map(std::path::PathBuf::from)
        .ok()
        .or_else(|| {
            std::env::var_os("HOME")
                .map(|h| std::path::PathBuf::from(h).join(".local/state/complyctl"))
        })?;
    if let Err(e) = std::fs::create_dir_all(&dir) {
        eprintln!("warning: cannot create log dir {}: {e}", dir.display());
        return None;
    }
    let name = format!("complyctl-{}.log", chrono::Local::now().format("%Y%m%d"));
    match std::fs::OpenOptions::new().create(true).append(true).open(dir.join(&name)) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("warning: cannot open log file {name}: {e}");
            None
        }
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("COMPLY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid COMPLY_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    init_metrics();

    let cancel = CancellationToken::new();
    let sig_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("Interrupted. Aborting cleanly; no rollback is attempted.");
            sig_cancel.cancel();
        }
    });

    if let Err(e) = run(cli, cancel).await {
        let category = e
            .downcast_ref::<InstallError>()
            .map(InstallError::category)
            .unwrap_or("error");
        error!(category, error = %e, "command failed");
        eprintln!("{category}: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let namespace = cli.namespace.clone().unwrap_or_else(config::namespace);
    match cli.command {
        Commands::Install(args) => run_install(args, &namespace, cli.debug, cancel).await,
        Commands::Uninstall { destroy_infra, yes } => {
            run_uninstall(&namespace, destroy_infra, yes, cancel).await
        }
        Commands::Status => run_status(&namespace).await,
        Commands::Bootstrap { username, role_name, org_units, stack_name } => {
            run_bootstrap(username, role_name, org_units, stack_name).await
        }
    }
}

async fn run_install(
    args: InstallArgs,
    namespace: &str,
    debug: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let release = config::release_name();

    report::step("Checking prerequisites");
    comply_cluster::probe_tool("helm", &["version", "--short"]).await?;
    let client = comply_cluster::kube_client().await?;
    let server = comply_cluster::probe_kube_auth(&client).await?;
    info!(server_version = %server, "kube API reachable");

    let cluster = comply_cluster::probe_cluster(&client, namespace).await?;
    let platform = match args.platform {
        PlatformArg::Aws => Platform::Aws,
        PlatformArg::Digitalocean => Platform::DigitalOcean,
        PlatformArg::Generic => Platform::Generic,
        PlatformArg::Auto => match cluster.provider {
            comply_core::ClusterProvider::Aws => Platform::Aws,
            _ => Platform::Generic,
        },
    };
    comply_cluster::probe_required_tools(platform).await?;

    let mut engine = IacEngine::Terraform;
    if platform == Platform::Aws {
        let identity = comply_cluster::probe_aws_identity().await?;
        info!(account = %identity.account, arn = %identity.arn, "AWS identity verified");
        engine = comply_cluster::detect_iac_engine().await?;
    }

    if !args.upgrade {
        comply_cluster::gate::enforce(&cluster, namespace, &release).await?;
    }

    let input: Box<dyn InputProvider> = if args.yes {
        Box::new(AssumeDefaults { assume_yes: true })
    } else {
        Box::new(TerminalInput)
    };

    let install_type = resolve_install_type(args.install_type, input.as_ref()).await?;

    let domain = args.domain.clone().filter(|d| !d.is_empty());
    let existing_cert: Option<CertificateRef> = match (&domain, platform) {
        (Some(d), Platform::Aws) => aws::find_issued_certificate(d).await?,
        _ => None,
    };

    let target = DeploymentTarget {
        platform,
        domain: domain.clone(),
        email: args.email.clone(),
        use_https: domain.is_some() && (existing_cert.is_some() || args.email.is_some()),
        region: args.region.clone(),
    };
    target.validate()?;

    let infra_present = if platform == Platform::Aws {
        infra::state_present(engine).await?
    } else {
        false
    };
    let use_existing_infra = if infra_present {
        args.use_existing
            || input
                .confirm("Existing infrastructure state found. Use it?", true)
                .await?
    } else {
        false
    };

    let opts = PlanOptions {
        install_type,
        use_existing_infra,
        upgrade: args.upgrade,
        debug,
    };
    let actions = plan(&PlanInput {
        target: &target,
        cluster: &cluster,
        existing_cert: existing_cert.as_ref(),
        infra_present,
        opts: &opts,
    });
    report::print_plan(&actions);

    for action in &actions {
        if cancel.is_cancelled() {
            return Err(InstallError::Aborted.into());
        }
        report::step(&action.idempotency_key());
        let progress = if matches!(action, ReconcileAction::CreateInfra { .. }) {
            let (tx, mut rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(sample) = rx.recv().await {
                    report::progress_line(&sample);
                }
            });
            Some(tx)
        } else {
            None
        };
        let ctx = ReconcileCtx {
            client: &client,
            input: input.as_ref(),
            engine,
            always_apply: args.always_apply,
            cancel: &cancel,
            progress,
        };
        reconcile(&ctx, action).await?;
    }

    report::step("Waiting for workloads");
    let migrator = config::migrator_job();
    if comply_wait::job_exists(&client, namespace, &migrator).await? {
        match comply_wait::job_complete(&client, namespace, &migrator, &cancel).await? {
            WaitOutcome::Ready(()) => info!(job = %migrator, "migration complete"),
            WaitOutcome::TimedOut { last } => {
                return Err(InstallError::Timeout { what: format!("migration job {migrator}"), last }.into());
            }
        }
    }
    match comply_wait::pods_healthy(&client, namespace, &cancel).await? {
        WaitOutcome::Ready(()) => {}
        WaitOutcome::TimedOut { last } => {
            // Fatal: surface the last pod table in the log and the error.
            error!(pods = %last, "pods never became healthy");
            return Err(InstallError::Timeout { what: format!("pods in {namespace}"), last }.into());
        }
    }

    if actions.iter().any(|a| matches!(a, ReconcileAction::ApplyIssuer { .. })) {
        report::step("Waiting for certificate issuer");
        match comply_wait::issuer_ready(&client, ISSUER_NAME, &cancel).await? {
            WaitOutcome::Ready(()) => {}
            WaitOutcome::TimedOut { last } => {
                return Err(InstallError::Timeout { what: "certificate issuer".to_string(), last }.into());
            }
        }
    }

    let access = resolve_access(&client, namespace, &actions, &cancel).await?;
    report::summary(&access);
    Ok(())
}

/// Decide how the operator reaches the app, waiting for an external address
/// where one is expected. Address timeouts degrade to port-forward.
async fn resolve_access(
    client: &kube::Client,
    namespace: &str,
    actions: &[ReconcileAction],
    cancel: &CancellationToken,
) -> Result<Access> {
    let shape = actions.iter().find_map(|a| match a {
        ReconcileAction::ApplyIngress { shape, .. } => Some(shape.clone()),
        _ => None,
    });
    let Some(shape) = shape else {
        return Ok(Access::PortForward { namespace: namespace.to_string() });
    };

    report::step("Waiting for external address");
    let outcome = match &shape {
        // The ALB path surfaces its address on the ingress object itself.
        IngressShape::HostTls { tls: TlsSource::AcmCertificate { .. }, .. } => {
            comply_wait::ingress_address(client, namespace, comply_apply::ingress::INGRESS_NAME, cancel)
                .await?
        }
        _ => {
            comply_wait::service_address(client, INGRESS_NGINX_NAMESPACE, INGRESS_NGINX_SERVICE, cancel)
                .await?
        }
    };

    let proto = if shape.is_tls() { "https" } else { "http" };
    Ok(match (outcome, shape.host()) {
        (WaitOutcome::Ready(addr), Some(host)) => Access::Url {
            url: format!("{proto}://{host}"),
            dns_target: Some(addr),
            port_forward_alt: None,
        },
        (WaitOutcome::Ready(addr), None) => Access::Url {
            url: format!("http://{addr}"),
            dns_target: None,
            // No DNS name to hand out; port-forward stays the simple path.
            port_forward_alt: Some(namespace.to_string()),
        },
        (WaitOutcome::TimedOut { last }, host) => {
            warn!(last = %last, "no external address; falling back to port-forward");
            report::address_timeout_fallback(namespace, &last);
            match host {
                // The domain still works once DNS is pointed at the LB.
                Some(h) => Access::Url {
                    url: format!("{proto}://{h}"),
                    dns_target: None,
                    port_forward_alt: None,
                },
                None => Access::PortForward { namespace: namespace.to_string() },
            }
        }
    })
}

async fn run_uninstall(
    namespace: &str,
    destroy_infra: bool,
    yes: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let release = config::release_name();
    let input: Box<dyn InputProvider> = if yes {
        Box::new(AssumeDefaults { assume_yes: true })
    } else {
        Box::new(TerminalInput)
    };

    let question = format!("Uninstall release {release} from namespace {namespace}? This cannot be undone");
    if !input.confirm(&question, false).await? {
        return Err(InstallError::Aborted.into());
    }
    comply_apply::helm::uninstall(&release, namespace).await?;
    println!("Release {release} removed.");

    if destroy_infra {
        let engine = comply_cluster::detect_iac_engine().await?;
        let client = comply_cluster::kube_client().await?;
        let ctx = ReconcileCtx {
            client: &client,
            input: input.as_ref(),
            engine,
            always_apply: false,
            cancel: &cancel,
            progress: None,
        };
        let res = reconcile(&ctx, &ReconcileAction::DestroyInfra { platform: Platform::Aws }).await?;
        println!("{}", res.detail);
    }
    Ok(())
}

async fn run_status(namespace: &str) -> Result<()> {
    let client = comply_cluster::kube_client().await?;
    let server = comply_cluster::probe_kube_auth(&client).await?;
    let cluster = comply_cluster::probe_cluster(&client, namespace).await?;
    println!("kube API:    v{server}");
    println!("provider:    {:?}", cluster.provider);
    println!("ready nodes: {}", cluster.ready_nodes);
    match comply_cluster::gate::check(&cluster, namespace, &config::release_name()) {
        Ok(()) => println!("gate:        suitable for install"),
        Err(e) => println!("gate:        {e}"),
    }
    if cluster.releases.is_empty() {
        println!("releases:    (none in {namespace})");
    } else {
        println!("NAME                 VERSION      STATUS");
        for r in &cluster.releases {
            println!(
                "{:<20} {:<12} {:?}",
                r.name,
                r.chart_version.as_deref().unwrap_or("-"),
                r.status
            );
        }
    }
    Ok(())
}

async fn run_bootstrap(
    username: String,
    role_name: String,
    org_units: Vec<String>,
    stack_name: String,
) -> Result<()> {
    if org_units.is_empty() {
        return Err(InstallError::InvalidInput(
            "at least one --org-units entry is required".to_string(),
        )
        .into());
    }
    comply_cluster::probe_tool("aws", &["--version"]).await?;
    let identity = comply_cluster::probe_aws_identity().await?;
    info!(account = %identity.account, "deploying bootstrap stack");
    let params = aws::BootstrapParams {
        iam_username: username,
        role_name,
        organization_units: org_units,
    };
    aws::deploy_bootstrap(&stack_name, &params).await?;
    println!("Bootstrap stack {stack_name} deployed in account {}.", identity.account);
    Ok(())
}
