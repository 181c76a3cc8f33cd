//! CLI tests

use clap::{CommandFactory, Parser};

use crate::{Cli, Commands, ConfigAction, ContextAction, ExecutionAction, OutputFormat};

#[test]
fn test_cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn test_run_parses_flags() {
    let cli = Cli::try_parse_from([
        "demiarch-agents",
        "run",
        "Add password reset",
        "--project",
        "shop",
        "--offline",
        "--model",
        "anthropic/claude-3-haiku",
        "--max-context-tokens",
        "2000",
    ])
    .unwrap();

    match cli.command {
        Commands::Run {
            description,
            project,
            offline,
            model,
            max_context_tokens,
            feature,
        } => {
            assert_eq!(description, "Add password reset");
            assert_eq!(project, "shop");
            assert!(offline);
            assert_eq!(model.as_deref(), Some("anthropic/claude-3-haiku"));
            assert_eq!(max_context_tokens, Some(2000));
            assert!(feature.is_none());
        }
        _ => panic!("expected run"),
    }
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "demiarch-agents",
        "executions",
        "list",
        "--db",
        "/tmp/agents.db",
        "--format",
        "json",
        "-v",
    ])
    .unwrap();

    assert_eq!(cli.format, OutputFormat::Json);
    assert!(cli.verbose);
    assert_eq!(cli.db.unwrap().to_str(), Some("/tmp/agents.db"));
    assert!(matches!(
        cli.command,
        Commands::Executions {
            action: ExecutionAction::List { limit: 20 }
        }
    ));
}

#[test]
fn test_context_add_defaults() {
    let cli = Cli::try_parse_from(["demiarch-agents", "context", "add", "Users sign in with email"]).unwrap();
    match cli.command {
        Commands::Context {
            action:
                ContextAction::Add {
                    project,
                    source_type,
                    source_id,
                    ..
                },
        } => {
            assert_eq!(project, "default");
            assert_eq!(source_type, "document");
            assert!(source_id.is_none());
        }
        _ => panic!("expected context add"),
    }
}

#[test]
fn test_config_set_requires_value() {
    assert!(Cli::try_parse_from(["demiarch-agents", "config", "set", "llm.temperature"]).is_err());
    let cli = Cli::try_parse_from(["demiarch-agents", "config", "set", "llm.temperature", "0.2"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Config {
            action: ConfigAction::Set { .. }
        }
    ));
}

#[test]
fn test_run_requires_description() {
    assert!(Cli::try_parse_from(["demiarch-agents", "run"]).is_err());
}
