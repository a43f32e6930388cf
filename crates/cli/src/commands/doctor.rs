use dealsync_core::config::{AppConfig, CrmMode, LoadOptions};
use dealsync_db::{connect_with_config, migrations, ping};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_webhook_secrets(&config));
            checks.push(check_crm_mode(&config));
            checks.push(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["webhook_secrets", "crm_mode", "database"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_webhook_secrets(config: &AppConfig) -> DoctorCheck {
    let missing = config.unconfigured_webhook_sources();
    if missing.is_empty() {
        DoctorCheck {
            name: "webhook_secrets",
            status: CheckStatus::Pass,
            details: "every webhook source has a secret".to_string(),
        }
    } else {
        DoctorCheck {
            name: "webhook_secrets",
            status: CheckStatus::Fail,
            details: format!("deliveries will be rejected for: {}", missing.join(", ")),
        }
    }
}

fn check_crm_mode(config: &AppConfig) -> DoctorCheck {
    let details = match config.crm.mode {
        CrmMode::Local => "local mode: deals are read from and written to the sqlite mirror".to_string(),
        CrmMode::Http => format!(
            "http mode against `{}`",
            config.crm.base_url.as_deref().unwrap_or("<unset>")
        ),
    };
    DoctorCheck { name: "crm_mode", status: CheckStatus::Pass, details }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck {
                name: "database",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let checked = match ping(&pool).await {
            Ok(()) => Ok(migrations::MIGRATOR.iter().count()),
            Err(error) => Err(format!("database query failed: {error}")),
        };
        pool.close().await;
        checked
    });

    match result {
        Ok(known) => DoctorCheck {
            name: "database",
            status: CheckStatus::Pass,
            details: format!("connected using `{}` ({known} migration(s) embedded)", config.database.url),
        },
        Err(error) => DoctorCheck { name: "database", status: CheckStatus::Fail, details: error },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
