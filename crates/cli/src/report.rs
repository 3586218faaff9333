//! Presentation only: progress lines, the plan summary, and the final
//! access instructions. No business logic lives here.

use comply_core::{config, ProgressSample, ReconcileAction};

/// How the operator reaches the installed app. A hostless install carries
/// the namespace too, so the port-forward alternative can be offered next
/// to the raw load-balancer URL.
#[derive(Debug, Clone)]
pub enum Access {
    Url {
        url: String,
        dns_target: Option<String>,
        port_forward_alt: Option<String>,
    },
    PortForward { namespace: String },
}

pub fn step(msg: &str) {
    println!("==> {msg}");
}

pub fn progress_line(sample: &ProgressSample) {
    println!(
        "    infrastructure apply: {}% ({}/{})",
        sample.percent(),
        sample.completed,
        sample.total
    );
}

pub fn print_plan(actions: &[ReconcileAction]) {
    println!("Plan ({} step(s)):", actions.len());
    for (i, a) in actions.iter().enumerate() {
        println!("  {}. {}", i + 1, a.idempotency_key());
    }
}

fn port_forward_command(namespace: &str) -> String {
    format!(
        "kubectl port-forward -n {namespace} svc/{} {}:{}",
        config::APP_SERVICE,
        config::PORT_FORWARD_LOCAL_PORT,
        config::APP_SERVICE_PORT
    )
}

pub fn summary(access: &Access) {
    println!();
    println!("Installation complete.");
    match access {
        Access::Url { url, dns_target, port_forward_alt } => {
            println!("  Open: {url}");
            if let Some(target) = dns_target {
                println!("  (point your DNS record at: {target})");
            }
            if let Some(ns) = port_forward_alt {
                println!("  Or run:  {}", port_forward_command(ns));
                println!(
                    "  and open http://localhost:{}",
                    config::PORT_FORWARD_LOCAL_PORT
                );
            }
        }
        Access::PortForward { namespace } => {
            println!("  Run:  {}", port_forward_command(namespace));
            println!(
                "  Then open: http://localhost:{}",
                config::PORT_FORWARD_LOCAL_PORT
            );
        }
    }
    println!(
        "  Default login: {} / {} (change it after first sign-in)",
        config::DEFAULT_LOGIN,
        config::DEFAULT_PASSWORD
    );
}

/// Fallback note when the external address never arrived; not fatal.
pub fn address_timeout_fallback(namespace: &str, last: &str) {
    eprintln!("No external address was assigned in time (last: {last}).");
    eprintln!("You can still reach the app with:");
    eprintln!("  {}", port_forward_command(namespace));
}
