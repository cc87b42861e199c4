//! Subcommand implementations
//!
//! Each command returns the process exit code; hard failures come back as
//! [`StackError`] and are mapped by `main`.

use stackctl_core::prelude::*;
use stackctl_core::rollout::ExitStatus;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

/// Paths shared by every command
#[derive(Debug, Clone)]
pub(crate) struct Context {
    pub(crate) env: PathBuf,
    pub(crate) manifest: PathBuf,
}

/// `deploy` switches
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DeployOptions {
    pub(crate) skip_provision: bool,
    pub(crate) with_certs: bool,
    pub(crate) json: bool,
}

fn internal(e: impl std::fmt::Display) -> StackError {
    StackError::Internal(e.to_string())
}

impl Context {
    fn env_source(&self) -> EnvSource {
        EnvSource::File(self.env.clone())
    }

    fn load_bundle(&self) -> Result<ConfigBundle, StackError> {
        let bundle = ConfigLoader::standard().load(&self.env_source())?;
        tracing::info!(keys = bundle.len(), path = %self.env.display(), "environment validated");
        Ok(bundle)
    }

    fn load_manifest(&self) -> Result<Manifest, StackError> {
        Ok(Manifest::from_file(&self.manifest)?)
    }
}

/// `validate`: report every violation, then the derived keys
pub(crate) fn validate(ctx: &Context) -> Result<ExitCode, StackError> {
    let loader = ConfigLoader::standard();
    let violations = loader.check(&ctx.env_source())?;
    if !violations.is_empty() {
        for violation in &violations {
            println!("invalid: {violation}");
        }
        return Ok(ExitCode::ConfigInvalid);
    }
    let bundle = loader.load(&ctx.env_source())?;
    let manifest = ctx.load_manifest()?;
    let plan = RolloutPlan::build(manifest.service_specs())?;

    println!(
        "ok: {} keys, {} services in {} tiers",
        bundle.len(),
        plan.service_count(),
        plan.tiers().len()
    );
    for key in bundle.derived_keys() {
        println!("  {key}={}", bundle.display_value(key).unwrap_or_default());
    }
    Ok(ExitCode::Success)
}

/// Text rendering of the tier plan
pub(crate) fn render_plan(plan: &RolloutPlan) -> String {
    let mut out = String::new();
    for tier in plan.tiers() {
        let _ = writeln!(out, "tier {}", tier.index);
        for service in &tier.services {
            let _ = write!(
                out,
                "  {:<20} {:<12} probe={}",
                service.name,
                service.criticality,
                service.probe.kind()
            );
            if !service.depends_on.is_empty() {
                let _ = write!(out, " after={}", service.depends_on.join(","));
            }
            out.push('\n');
        }
    }
    out
}

/// `plan`
pub(crate) fn plan(ctx: &Context) -> Result<ExitCode, StackError> {
    let manifest = ctx.load_manifest()?;
    let plan = RolloutPlan::build(manifest.service_specs())?;
    print!("{}", render_plan(&plan));
    Ok(ExitCode::Success)
}

/// `deploy`: provision, roll out, optionally cut over certificates
pub(crate) async fn deploy(ctx: &Context, options: DeployOptions) -> Result<ExitCode, StackError> {
    let bundle = Arc::new(ctx.load_bundle()?);
    let manifest = ctx.load_manifest()?;
    let plan = RolloutPlan::build(manifest.service_specs())?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(manifest.compose_runtime());

    if options.skip_provision {
        tracing::info!("provisioning skipped");
    } else {
        let provisioned = Provisioner::new(Arc::clone(&runtime))
            .provision(&manifest.provision_spec())
            .await?;
        for warning in &provisioned.warnings {
            tracing::warn!(warning = %warning, "provisioning");
        }
        tracing::info!(changes = provisioned.changes(), "host provisioned");
    }

    let prober = Arc::new(StandardProber::new(Arc::clone(&runtime), manifest.command_timeout()));
    let controller = RolloutController::new(runtime, prober)
        .with_log_tail_lines(manifest.runtime.log_tail_lines)
        .with_run_timeout(manifest.run_timeout())
        .with_secrets(Arc::clone(&bundle));
    let result = controller.rollout(&plan).await;
    let summary = report(&result);

    if summary.status == ExitStatus::Fatal || !options.with_certs {
        print_summary(&summary, None, options.json)?;
        return Ok(ExitCode::from_status(summary.status));
    }

    let outcome = run_cutover(&manifest, &bundle, false).await;
    match outcome {
        Ok(outcome) => {
            print_summary(&summary, Some(&outcome), options.json)?;
            Ok(ExitCode::from_status(summary.status))
        }
        Err(e) => {
            print_summary(&summary, None, options.json)?;
            Err(e)
        }
    }
}

fn print_summary(summary: &Summary, cutover: Option<&CutoverOutcome>, json: bool) -> Result<(), StackError> {
    if json {
        let doc = serde_json::json!({ "rollout": summary, "cutover": cutover });
        println!("{}", serde_json::to_string_pretty(&doc).map_err(internal)?);
    } else {
        print!("{}", summary.render_text());
        if let Some(outcome) = cutover {
            println!("{}", render_outcome(outcome));
        }
    }
    Ok(())
}

/// One-line description of a cutover outcome
pub(crate) fn render_outcome(outcome: &CutoverOutcome) -> String {
    let mut line = format!("certificates: {}", outcome.final_state);
    if outcome.skipped {
        line.push_str(" (already current)");
    } else if outcome.reloaded {
        line.push_str(" (reloaded)");
    }
    if let Some(cert) = &outcome.certificate {
        let _ = write!(line, ", valid until {}", cert.not_after.format("%Y-%m-%d"));
    }
    line
}

async fn run_cutover(manifest: &Manifest, bundle: &ConfigBundle, force: bool) -> Result<CutoverOutcome, StackError> {
    let cutover = CertificateCutover::new(
        Arc::new(manifest.file_proxy()?),
        Arc::new(manifest.certbot_client()?),
        manifest.proxy_templates()?,
        manifest.cutover_settings(bundle)?,
    );
    Ok(cutover.run(force).await?)
}

/// `certs`
pub(crate) async fn certs(ctx: &Context, force: bool) -> Result<ExitCode, StackError> {
    let bundle = ctx.load_bundle()?;
    let manifest = ctx.load_manifest()?;
    let outcome = run_cutover(&manifest, &bundle, force).await?;
    println!("{}", render_outcome(&outcome));
    Ok(ExitCode::Success)
}

/// `status`
pub(crate) async fn status(ctx: &Context, json: bool) -> Result<ExitCode, StackError> {
    let manifest = ctx.load_manifest()?;
    let plan = RolloutPlan::build(manifest.service_specs())?;
    let runtime = manifest.compose_runtime();

    let mut rows = Vec::with_capacity(plan.service_count());
    for service in plan.services() {
        let status = match runtime.status(&service.name).await {
            Ok(status) => status.to_string(),
            Err(e) => {
                tracing::warn!(service = %service.name, error = %e, "status query failed");
                "unknown".to_string()
            }
        };
        rows.push(serde_json::json!({
            "name": service.name,
            "tier": service.tier,
            "criticality": service.criticality,
            "status": status,
        }));
        if !json {
            println!("[tier {}] {:<20} {}", service.tier, service.name, status);
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&rows).map_err(internal)?);
    }
    Ok(ExitCode::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackctl_core::cutover::CutoverState;

    #[test]
    fn plan_rendering_lists_tiers_in_order() {
        let plan = RolloutPlan::build(vec![
            ServiceSpec::new("api", 1).blocking().depends_on("postgres"),
            ServiceSpec::new("postgres", 0).with_role(ServiceRole::Data),
            ServiceSpec::new("grafana", 2),
        ])
        .unwrap();
        let text = render_plan(&plan);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "tier 0");
        assert!(lines[1].contains("postgres") && lines[1].contains("blocking"));
        assert!(lines[3].contains("after=postgres"));
        assert!(lines[5].contains("best-effort") && lines[5].contains("probe=status"));
    }

    #[test]
    fn skipped_outcome_rendering() {
        let outcome = CutoverOutcome {
            final_state: CutoverState::ProductionMode,
            reloaded: false,
            skipped: true,
            certificate: None,
            history: Vec::new(),
        };
        assert_eq!(render_outcome(&outcome), "certificates: production mode (already current)");
    }

    #[test]
    fn validate_reports_weak_secret() {
        let tmp = tempfile::tempdir().unwrap();
        let mut env = stackctl_test_utils::valid_env();
        env.insert("DB_PASSWORD".into(), "changeme".into());
        let env_path = tmp.path().join(".env");
        std::fs::write(&env_path, stackctl_test_utils::env_file(&env)).unwrap();
        let manifest_path = tmp.path().join("stack.toml");
        std::fs::write(&manifest_path, "").unwrap();

        let ctx = Context {
            env: env_path,
            manifest: manifest_path,
        };
        assert_eq!(validate(&ctx).unwrap(), ExitCode::ConfigInvalid);
    }

    #[test]
    fn validate_accepts_good_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let env_path = tmp.path().join(".env");
        std::fs::write(&env_path, stackctl_test_utils::env_file(&stackctl_test_utils::valid_env())).unwrap();
        let manifest_path = tmp.path().join("stack.toml");
        std::fs::write(&manifest_path, "[[service]]\nname = \"postgres\"\ntier = 0\nrole = \"data\"\n").unwrap();

        let ctx = Context {
            env: env_path,
            manifest: manifest_path,
        };
        assert_eq!(validate(&ctx).unwrap(), ExitCode::Success);
    }
}
