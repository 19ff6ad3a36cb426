use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cohortsql::keyword;
use cohortsql::query::{
    CodesQueryCompiler, CohortQueryCompiler, ConceptScope, ParticipantCountCompiler,
    ParticipantCountQuery, QueryParameters, SearchParameter, SearchRequest,
};
use cohortsql::DomainRegistry;
use std::path::{Path, PathBuf};

/// Compile clinical search criteria into parameterized warehouse SQL
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Domain registry TOML file (default: <config dir>/cohortsql/registry.toml)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a codes query from DOMAIN:CODE pairs
    Codes {
        /// Code system the codes belong to (ICD9, ICD10, CPT)
        #[arg(long = "type")]
        code_type: String,
        /// Search parameters, e.g. Condition:250.01 Measurement:30.3
        #[arg(required = true, value_parser = parse_search_parameter)]
        params: Vec<SearchParameter>,
    },
    /// Compile a participant count query
    Count {
        #[arg(long)]
        domain: String,
        /// Fact table to count in, instead of the registry's table for the domain
        #[arg(long)]
        fact_table: Option<String>,
        #[arg(long, value_enum, default_value_t = Scope::Source)]
        scope: Scope,
        concept_ids: Vec<i64>,
    },
    /// Compile a cohort query from a JSON search request
    Cohort {
        /// JSON file holding `{"includes": [...], "excludes": [...]}`
        request: PathBuf,
        /// Page participant ids instead of counting them
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long, default_value_t = 0, requires = "limit")]
        offset: u64,
    },
    /// Turn a search phrase into a boolean-mode full-text query
    Keyword { text: Vec<String> },
    /// Print the active domain registry as TOML
    Registry,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scope {
    Source,
    Standard,
    MapToStandard,
}

impl From<Scope> for ConceptScope {
    fn from(scope: Scope) -> Self {
        match scope {
            Scope::Source => ConceptScope::Source,
            Scope::Standard => ConceptScope::Standard,
            Scope::MapToStandard => ConceptScope::MapToStandard,
        }
    }
}

fn parse_search_parameter(value: &str) -> Result<SearchParameter, String> {
    match value.split_once(':') {
        Some((domain, code)) if !domain.is_empty() => Ok(SearchParameter::new(domain, code)),
        _ => Err(format!("expected DOMAIN:CODE, got {value:?}")),
    }
}

fn read_search_request(path: &Path) -> Result<SearchRequest> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading search request {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("parsing search request {}", path.display()))
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let registry = match &cli.registry {
        Some(path) => DomainRegistry::load(path)
            .with_context(|| format!("loading registry {}", path.display()))?,
        None => DomainRegistry::load_default().context("loading default registry")?,
    };

    match cli.command {
        Command::Codes { code_type, params } => {
            let params = QueryParameters::new(code_type, params);
            let compiled = CodesQueryCompiler::new(&registry).build(&params)?;
            println!("{}", serde_json::to_string_pretty(&compiled)?);
        }
        Command::Count {
            domain,
            fact_table,
            scope,
            concept_ids,
        } => {
            let compiled = ParticipantCountCompiler::new(&registry).build_scoped(
                &domain,
                fact_table.as_deref(),
                &concept_ids,
                scope.into(),
            )?;
            match compiled {
                ParticipantCountQuery::Empty => {
                    println!("{}", serde_json::json!({ "count": 0 }));
                }
                ParticipantCountQuery::Query(query) => {
                    println!("{}", serde_json::to_string_pretty(&query)?);
                }
            }
        }
        Command::Cohort {
            request,
            limit,
            offset,
        } => {
            let request = read_search_request(&request)?;
            let compiler = CohortQueryCompiler::new(&registry);
            let compiled = match limit {
                Some(limit) => compiler.build_participant_ids(&request, limit, offset)?,
                None => compiler.build_count(&request)?,
            };
            println!("{}", serde_json::to_string_pretty(&compiled)?);
        }
        Command::Keyword { text } => {
            println!("{}", keyword::sanitize(&text.join(" ")));
        }
        Command::Registry => {
            print!("{}", registry.to_toml_string()?);
        }
    }

    Ok(())
}
