//! Interactive commands, read line by line from the standard input.

use std::io::{BufRead, Write};

use anyhow::{Context, anyhow};
use palantiri::{SamplingEngine, counter::CounterSpec};

const HELP: &str = "\
Available commands:
    add <category> <name> [instance] [alias=<alias>] [normalize] [wait]
    remove <alias>...
    list
    start
    stop
    sample
    recreate
    help
    exit";

#[derive(Debug, PartialEq)]
pub enum Command {
    Add(CounterSpec),
    Remove(Vec<String>),
    List,
    Start,
    Stop,
    /// Samples the counters once.
    Sample,
    /// Recreates the counters' resources once.
    Recreate,
    Help,
    Shutdown,
}

/// What to do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Parses a command from a string.
///
/// ## Available commands
///
/// - `add <category> <name> [instance] [alias=<alias>] [normalize] [wait]`: adds a counter
/// - `remove <alias>...`: removes one or more counters
/// - `list`: prints the active counters
/// - `start` and `stop`: starts or stops the sampling
/// - `sample`: samples the counters now, even if the sampling is stopped
/// - `recreate`: recreates the counters' resources now
/// - `shutdown` or `exit`: stops the agent
pub fn parse(command: &str) -> anyhow::Result<Command> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    match parts.as_slice() {
        [] => Err(anyhow!("empty command")),
        ["add", args @ ..] => parse_add(args).map(Command::Add),
        ["remove"] => Err(anyhow!("missing aliases after 'remove'")),
        ["remove", aliases @ ..] => Ok(Command::Remove(aliases.iter().map(|a| a.to_string()).collect())),
        ["list"] => Ok(Command::List),
        ["start"] => Ok(Command::Start),
        ["stop"] => Ok(Command::Stop),
        ["sample"] => Ok(Command::Sample),
        ["recreate"] => Ok(Command::Recreate),
        ["help"] => Ok(Command::Help),
        ["shutdown"] | ["exit"] => Ok(Command::Shutdown),
        [cmd, ..] => Err(anyhow!("unknown command '{cmd}', type 'help' to list the commands")),
    }
}

fn parse_add(args: &[&str]) -> anyhow::Result<CounterSpec> {
    let (category, name, rest) = match args {
        [category, name, rest @ ..] => (*category, *name, rest),
        _ => return Err(anyhow!("usage: add <category> <name> [instance] [alias=<alias>] [normalize] [wait]")),
    };
    let mut instance = None;
    let mut alias = None;
    let mut normalize = false;
    let mut wait = false;
    for arg in rest {
        match *arg {
            "normalize" => normalize = true,
            "wait" => wait = true,
            a => {
                if let Some(value) = a.strip_prefix("alias=") {
                    if value.is_empty() {
                        return Err(anyhow!("empty alias"));
                    }
                    alias = Some(value.to_owned());
                } else if instance.is_none() {
                    instance = Some(a.to_owned());
                } else {
                    return Err(anyhow!("unexpected argument '{a}'"));
                }
            }
        }
    }
    let mut spec = CounterSpec::new(category, name, instance);
    spec.alias = alias;
    spec.normalize = normalize;
    spec.wait_for_instance = wait;
    Ok(spec)
}

impl Command {
    /// Applies the command to the engine, and prints its result to `out`.
    pub fn run(self, engine: &SamplingEngine, out: &mut dyn Write) -> anyhow::Result<Flow> {
        match self {
            Command::Add(spec) => {
                let alias = engine.add_counter(spec)?;
                writeln!(out, "Added: {alias}")?;
            }
            Command::Remove(aliases) => {
                let mut write_res = Ok(());
                let n = engine.remove_counters(aliases, |alias| {
                    if write_res.is_ok() {
                        write_res = writeln!(out, "Removed: {alias}");
                    }
                });
                write_res?;
                if n == 0 {
                    writeln!(out, "No counter removed")?;
                }
            }
            Command::List => {
                let counters = engine.counters();
                if counters.is_empty() {
                    writeln!(out, "No counter")?;
                }
                for alias in counters {
                    writeln!(out, "- {alias}")?;
                }
            }
            Command::Start => {
                engine.start();
                writeln!(out, "Sampling started")?;
            }
            Command::Stop => {
                engine.stop();
                writeln!(out, "Sampling stopped")?;
            }
            Command::Sample => {
                let snapshot = engine.sample_now();
                for (alias, value) in snapshot.iter() {
                    writeln!(out, "{alias}={}", value.value)?;
                }
            }
            Command::Recreate => {
                engine.recreate_now();
                writeln!(out, "Counters recreated")?;
            }
            Command::Help => {
                writeln!(out, "{HELP}")?;
            }
            Command::Shutdown => return Ok(Flow::Shutdown),
        }
        Ok(Flow::Continue)
    }
}

/// Reads commands from `input` until the end of the stream or until a shutdown command.
///
/// Invalid and failing commands are reported to `output`, they do not stop the loop.
pub fn run_commands(engine: &SamplingEngine, input: impl BufRead, output: &mut dyn Write) -> anyhow::Result<()> {
    for line in input.lines() {
        let line = line.context("could not read command")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let res = parse(line).and_then(|cmd| cmd.run(engine, output));
        match res {
            Ok(Flow::Continue) => (),
            Ok(Flow::Shutdown) => {
                log::info!("Shutdown requested");
                return Ok(());
            }
            Err(e) => {
                log::error!("Command '{line}' failed: {e:#}");
                writeln!(output, "Error: {e:#}")?;
            }
        }
        output.flush()?;
    }
    log::debug!("End of the command stream");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indoc::indoc;
    use palantiri::{
        EngineBuilder, EngineState, SamplingEngine, config::EngineConfig, counter::CounterSpec, test::FakeResolver,
    };
    use pretty_assertions::assert_eq;

    use super::{Command, Flow, parse, run_commands};

    fn engine() -> SamplingEngine {
        let resolver = FakeResolver::new()
            .with_constant("cpu/usage[total]", 50.0)
            .with_constant("memory/MemFree", 1024.0);
        EngineBuilder::new(EngineConfig::default())
            .counter(CounterSpec::new("cpu", "usage", Some("total")).with_alias("cpu"))
            .build(Arc::new(resolver))
            .unwrap()
    }

    #[test]
    fn parse_commands() {
        assert_eq!(parse("list").unwrap(), Command::List);
        assert_eq!(parse("  exit ").unwrap(), Command::Shutdown);
        assert_eq!(parse("shutdown").unwrap(), Command::Shutdown);
        assert_eq!(
            parse("remove a b").unwrap(),
            Command::Remove(vec![String::from("a"), String::from("b")])
        );
        assert_eq!(
            parse("add process cpu_usage nginx alias=web normalize wait").unwrap(),
            Command::Add(
                CounterSpec::new("process", "cpu_usage", Some("nginx"))
                    .with_alias("web")
                    .normalized()
                    .waiting_for_instance()
            )
        );
        assert_eq!(
            parse("add memory MemFree").unwrap(),
            Command::Add(CounterSpec::new("memory", "MemFree", None::<String>))
        );
    }

    #[test]
    fn parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("remove").is_err());
        assert!(parse("add cpu").is_err());
        assert!(parse("add cpu usage total cpu0").is_err());
        assert!(parse("add cpu usage alias=").is_err());
        assert!(parse("dance").is_err());
    }

    #[test]
    fn run_single_commands() {
        let engine = engine();
        let mut out = Vec::new();
        assert_eq!(Command::Stop.run(&engine, &mut out).unwrap(), Flow::Continue);
        assert_eq!(Command::Shutdown.run(&engine, &mut out).unwrap(), Flow::Shutdown);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(String::from_utf8(out).unwrap(), "Sampling stopped\n");
    }

    #[test]
    fn command_session() {
        let _ = env_logger::Builder::from_default_env().is_test(true).try_init();
        let engine = engine();
        let input = indoc! {"
            list
            add memory MemFree alias=free

            add memory MemFree alias=free
            add disk io
            sample
            remove cpu unknown
            remove cpu
            list
            exit
            list
        "};
        let mut out = Vec::new();
        run_commands(&engine, input.as_bytes(), &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "- cpu");
        assert_eq!(lines[1], "Added: free");
        assert!(lines[2].starts_with("Error: "), "{}", lines[2]);
        assert!(lines[3].starts_with("Error: "), "{}", lines[3]);
        assert_eq!(&lines[4..], &["cpu=50", "free=1024", "Removed: cpu", "No counter removed", "- free"]);
        assert_eq!(engine.counters(), vec!["free"]);
    }

    #[test]
    fn start_stop() {
        let engine = engine();
        let mut out = Vec::new();
        run_commands(&engine, "start\n".as_bytes(), &mut out).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        run_commands(&engine, "stop\n".as_bytes(), &mut out).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(String::from_utf8(out).unwrap(), "Sampling started\nSampling stopped\n");
    }
}
