use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use dbharbor_core::{
    AppConfigStore, ConnectionIdentity, ConnectionManager, ConnectionNode, ConnectionProfile,
    ProfileStore, QueryGateway, QueryResult, SchemaBrowser, parse_query_file_name,
    query_file_name,
};

use crate::setup::build_manager;

const USAGE: &str = "\
Usage: dbharbor <command> [args]

Commands:
  profiles                              List saved connection profiles
  databases <profile> [--refresh]       List databases on the profile's server
  views <profile> <database>            List views of a database
  query <profile> <sql> [--db <name>]   Run one statement
  create-database <profile> <name>      Create a database
  drop-database <profile> <name>        Drop a database
  file-name <profile> [--db <name>]     Print the query file name for a target
  resolve-file <file>                   Find the profile a query file belongs to";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Profiles,
    Databases { profile: String, refresh: bool },
    Views { profile: String, database: String },
    Query { profile: String, sql: String, database: Option<String> },
    CreateDatabase { profile: String, name: String },
    DropDatabase { profile: String, name: String },
    FileName { profile: String, database: Option<String> },
    ResolveFile { file: String },
}

/// Parse `args` (program name first) into a command.
pub fn parse(args: &[String]) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut database = None;
    let mut refresh = false;

    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(Command::Help),
            "--refresh" => refresh = true,
            "--db" => {
                database = Some(rest.next().ok_or("--db needs a database name")?.clone());
            }
            other if other.starts_with("--") => return Err(format!("Unknown option: {other}")),
            other => positional.push(other.to_string()),
        }
    }

    let Some((command, operands)) = positional.split_first() else {
        return Ok(Command::Help);
    };

    let command = match (command.as_str(), operands) {
        ("help", []) => Command::Help,
        ("profiles", []) => Command::Profiles,
        ("databases", [profile]) => Command::Databases {
            profile: profile.clone(),
            refresh,
        },
        ("views", [profile, database]) => Command::Views {
            profile: profile.clone(),
            database: database.clone(),
        },
        ("query", [profile, sql]) => Command::Query {
            profile: profile.clone(),
            sql: sql.clone(),
            database: database.take(),
        },
        ("create-database", [profile, name]) => Command::CreateDatabase {
            profile: profile.clone(),
            name: name.clone(),
        },
        ("drop-database", [profile, name]) => Command::DropDatabase {
            profile: profile.clone(),
            name: name.clone(),
        },
        ("file-name", [profile]) => Command::FileName {
            profile: profile.clone(),
            database: database.take(),
        },
        ("resolve-file", [file]) => Command::ResolveFile { file: file.clone() },
        (other, _) => return Err(format!("Unknown command or wrong arguments: {other}")),
    };

    Ok(command)
}

pub fn run(args: &[String]) -> i32 {
    let command = match parse(args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!("{USAGE}");
            return 2;
        }
    };

    if command == Command::Help {
        println!("{USAGE}");
        return 0;
    }

    let result = open_session().and_then(|session| {
        let mut stdout = io::stdout().lock();
        let outcome = session.execute(&command, &mut stdout);
        session.manager.close_all();
        outcome
    });

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {e:#}");
            1
        }
    }
}

fn open_session() -> Result<Session> {
    let store = AppConfigStore::new().context("failed to locate configuration")?;
    let config = store
        .load()
        .with_context(|| format!("failed to load {}", store.path().display()))?;
    let profiles = ProfileStore::new().context("failed to locate profile store")?;

    log::debug!(
        "Using config {} and profiles {}",
        store.path().display(),
        profiles.path().display()
    );

    Ok(Session::new(profiles, Arc::new(build_manager(config.manager))))
}

/// Saved profiles plus the manager that owns their connections.
pub struct Session {
    profiles: ProfileStore,
    manager: Arc<ConnectionManager>,
}

impl Session {
    pub fn new(profiles: ProfileStore, manager: Arc<ConnectionManager>) -> Self {
        Self { profiles, manager }
    }

    fn profile(&self, name: &str) -> Result<ConnectionProfile> {
        self.profiles
            .find(name)
            .with_context(|| format!("failed to read {}", self.profiles.path().display()))?
            .with_context(|| format!("no saved profile named '{name}'"))
    }

    fn node(&self, name: &str, database: Option<&str>) -> Result<ConnectionNode> {
        let node = self.profile(name)?.resolved_node();
        Ok(match database {
            Some(database) => node.for_database(Some(database)),
            None => node,
        })
    }

    pub fn execute(&self, command: &Command, out: &mut dyn Write) -> Result<()> {
        let browser = SchemaBrowser::new(self.manager.clone());

        match command {
            Command::Help => writeln!(out, "{USAGE}")?,
            Command::Profiles => {
                for profile in self.profiles.load()? {
                    writeln!(
                        out,
                        "{}\t{}\t{}",
                        profile.name,
                        profile.node.kind.display_name(),
                        profile.node.identity(None)
                    )?;
                }
            }
            Command::Databases { profile, refresh } => {
                let node = self.node(profile, None)?.for_database(None);
                let children = browser
                    .databases(&node, *refresh)
                    .with_context(|| format!("failed to list databases for '{profile}'"))?;
                for child in children {
                    writeln!(out, "{}", child.name)?;
                }
            }
            Command::Views { profile, database } => {
                let node = self.node(profile, Some(database))?;
                let views = browser
                    .views(&node, false)
                    .with_context(|| format!("failed to list views of {database}"))?;
                for view in views {
                    writeln!(out, "{}", view.name)?;
                }
            }
            Command::Query {
                profile,
                sql,
                database,
            } => {
                let node = self.node(profile, database.as_deref())?;
                let result = QueryGateway::new(self.manager.clone())
                    .execute(Some(&node), sql)
                    .context("query failed")?;
                render(&result, out)?;
            }
            Command::CreateDatabase { profile, name } => {
                let node = self.node(profile, None)?;
                browser
                    .create_database(&node, name)
                    .with_context(|| format!("failed to create database {name}"))?;
                writeln!(out, "created {name}")?;
            }
            Command::DropDatabase { profile, name } => {
                let node = self.node(profile, None)?;
                browser
                    .drop_database(&node, name)
                    .with_context(|| format!("failed to drop database {name}"))?;
                writeln!(out, "dropped {name}")?;
            }
            Command::FileName { profile, database } => {
                let node = self.node(profile, database.as_deref())?;
                writeln!(out, "{}", query_file_name(&node))?;
            }
            Command::ResolveFile { file } => {
                let (profile, identity) = self.resolve_file(file)?;
                writeln!(out, "{}\t{}", profile.name, identity)?;
            }
        }

        Ok(())
    }

    /// Match a query file name against the saved profiles by server and engine.
    fn resolve_file(&self, file: &str) -> Result<(ConnectionProfile, ConnectionIdentity)> {
        let Some(coords) = parse_query_file_name(file) else {
            bail!("'{file}' does not name a connection");
        };

        let server =
            ConnectionIdentity::from_coordinates(&coords.host, coords.port, &coords.user, None);

        let profile = self
            .profiles
            .load()?
            .into_iter()
            .find(|profile| {
                profile.node.server_identity() == server && profile.node.kind.mode() == coords.mode
            })
            .with_context(|| format!("no saved profile for {server} ({})", coords.mode))?;

        Ok((profile, coords.identity()))
    }
}

fn render(result: &QueryResult, out: &mut dyn Write) -> io::Result<()> {
    if result.columns.is_empty() {
        return writeln!(
            out,
            "{} rows affected ({:.2}ms)",
            result.affected_rows.unwrap_or(0),
            result.execution_time.as_secs_f64() * 1000.0
        );
    }

    let header: Vec<&str> = result.columns.iter().map(|c| c.name.as_str()).collect();
    writeln!(out, "{}", header.join("\t"))?;

    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|value| value.as_display_string()).collect();
        writeln!(out, "{}", cells.join("\t"))?;
    }

    writeln!(
        out,
        "({} rows, {:.2}ms)",
        result.row_count(),
        result.execution_time.as_secs_f64() * 1000.0
    )
}
