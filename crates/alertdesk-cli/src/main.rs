use alertdesk_schemas::Severity;
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "alertdesk")]
#[command(about = "Alert Rule Pipeline CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Rule compiler commands, run offline against the live pipeline crates
    Rule {
        #[command(subcommand)]
        cmd: RuleCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Subcommand)]
enum RuleCmd {
    /// Run a sentence through Parse -> Ground -> Synthesize -> Validate ->
    /// DedupCheck without persisting anything.
    Validate {
        #[arg(long)]
        user_id: Uuid,

        #[arg(long)]
        nl_text: String,

        #[arg(long, default_value = "med")]
        severity: String,
    },

    /// Same pipeline as `validate`, but persists the rule on a `Valid` result.
    Compile {
        #[arg(long)]
        user_id: Uuid,

        #[arg(long)]
        nl_text: String,

        #[arg(long, default_value = "med")]
        severity: String,
    },
}

fn parse_severity(raw: &str) -> Result<Severity> {
    match raw.to_ascii_lowercase().as_str() {
        "low" => Ok(Severity::Low),
        "med" | "medium" => Ok(Severity::Med),
        "high" => Ok(Severity::High),
        other => bail!("unknown severity {other:?}, expected low|med|high"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = alertdesk_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = alertdesk_db::status(&pool).await?;
                    println!("db_ok={} has_rules_table={}", s.ok, s.has_rules_table);
                }
                DbCmd::Migrate => {
                    alertdesk_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = alertdesk_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Rule { cmd } => run_rule_cmd(cmd).await?,
    }

    Ok(())
}

async fn run_rule_cmd(cmd: RuleCmd) -> Result<()> {
    let (user_id, nl_text, severity_raw, persist) = match cmd {
        RuleCmd::Validate { user_id, nl_text, severity } => (user_id, nl_text, severity, false),
        RuleCmd::Compile { user_id, nl_text, severity } => (user_id, nl_text, severity, true),
    };
    let severity = parse_severity(&severity_raw)?;

    let pool = alertdesk_db::connect_from_env().await?;

    let embed_provider = alertdesk_embed::provider_from_env()?;
    let embed = alertdesk_embed::EmbeddingService::new(std::sync::Arc::new(embed_provider));

    let llm_client = alertdesk_compiler::llm::client_from_env()?;
    let llm = alertdesk_compiler::llm::LlmService::new(std::sync::Arc::new(llm_client));

    let compiler = alertdesk_compiler::Compiler::new(pool.clone(), embed, llm, 0.92, 0.80);

    let result = compiler
        .compile(alertdesk_compiler::CompileRequest {
            user_id,
            nl_text: &nl_text,
            severity,
            editing_rule_id: None,
        })
        .await?;

    match result {
        alertdesk_compiler::CompileResult::Valid(rule) => {
            if persist {
                alertdesk_db::insert_rule(&pool, &rule).await?;
                let audit = alertdesk_audit::AuditWriter::new("audit/rules.jsonl", true)?;
                let mut audit = audit;
                audit.append(rule.id, "rule", "created", serde_json::json!({ "nl_text": rule.nl_text }))?;
                println!("status=valid rule_id={} persisted=true", rule.id);
            } else {
                println!("status=valid rule_id={} persisted=false", rule.id);
            }
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }
        alertdesk_compiler::CompileResult::DuplicateOf { existing_rule_id, similarity } => {
            println!("status=duplicate existing_rule_id={existing_rule_id} similarity={similarity:.4}");
        }
        alertdesk_compiler::CompileResult::Invalid { reason, hints } => {
            println!("status=invalid reason={reason}");
            for hint in hints {
                println!("hint: {hint}");
            }
        }
        alertdesk_compiler::CompileResult::Ambiguous { questions } => {
            println!("status=ambiguous");
            for q in questions {
                println!("question: {q}");
            }
        }
    }

    Ok(())
}
