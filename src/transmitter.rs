//! Command dispatch: token vectors onto server, jail and action state.
//!
//! The reply is always a `(code, value)` pair; failures carry the error
//! text verbatim so the client can print it. The verb surface follows the
//! control protocol table.

use std::sync::Arc;

use tracing::warn;

use jail_proto::{parse_bool, parse_interval, CommandFrame, LogLevel, Reply, Value};

use crate::action::{Action, CommandAction, ScriptedAction};
use crate::error::{Error, Result};
use crate::filter::SeekTo;
use crate::ip::UseDns;
use crate::jail::Jail;
use crate::server::Server;
use crate::telemetry::LogTarget;

/// Dispatches one command frame at a time.
pub struct Transmitter {
    server: Arc<Server>,
}

impl Transmitter {
    /// A transmitter bound to `server`.
    pub fn new(server: Arc<Server>) -> Transmitter {
        Transmitter { server }
    }

    /// Handle one frame; errors become `(1, text)` replies.
    pub async fn handle(&self, frame: &CommandFrame) -> Reply {
        match self.dispatch(&frame.0).await {
            Ok(value) => Reply::ok(value),
            Err(e) => {
                warn!(command = ?frame.0, error = %e, code = e.error_code(), "Command failed");
                Reply::err(e)
            }
        }
    }

    async fn dispatch(&self, tokens: &[String]) -> Result<Value> {
        let Some(verb) = tokens.first().map(String::as_str) else {
            return Ok(Value::Nil);
        };
        let args = &tokens[1..];
        match verb {
            "ping" => Ok(Value::from("pong")),
            "echo" => Ok(Value::list(args.to_vec())),
            "version" => Ok(Value::from(self.server.version())),
            "start" => match args {
                [] => Err(Error::Busy("Server already running".to_string())),
                [jail] => {
                    self.server.start_jail(jail).await?;
                    Ok(Value::Nil)
                }
                _ => Err(invalid(tokens)),
            },
            "stop" => match args {
                [] => {
                    self.server.quit().await;
                    Ok(Value::Nil)
                }
                [jail] => {
                    self.server.stop_jail(jail).await?;
                    Ok(Value::Nil)
                }
                _ => Err(invalid(tokens)),
            },
            "reload" | "restart" => self.handle_reload(verb, args).await,
            "status" => match args {
                [] => self.server.status(None).await,
                [all] if all == "--all" => self.server.status(Some("basic")).await,
                [all, flavor] if all == "--all" => self.server.status(Some(flavor.as_str())).await,
                [jail] => self.server.get_jail(jail)?.status("basic").await,
                [jail, flavor] => self.server.get_jail(jail)?.status(flavor).await,
                _ => Err(invalid(tokens)),
            },
            "stats" | "statistics" => Ok(self.server.stats()),
            "banned" => Ok(self.server.banned(args)),
            "unban" => match args {
                [all] if all == "--all" => Ok(Value::from(self.server.unban(None).await?)),
                [] => Err(invalid(tokens)),
                ids => Ok(Value::from(self.server.unban(Some(ids)).await?)),
            },
            "flushlogs" => Ok(Value::from(self.server.telemetry().flush_logs())),
            "add" => match args {
                [jail] => {
                    self.server.add_jail(jail, "auto").await?;
                    Ok(Value::from(jail.as_str()))
                }
                [jail, backend] => {
                    self.server.add_jail(jail, backend).await?;
                    Ok(Value::from(jail.as_str()))
                }
                _ => Err(invalid(tokens)),
            },
            "set" => match args {
                [] => Err(invalid(tokens)),
                _ => self.handle_set(&args[0], &args[1..]).await,
            },
            "get" => match args {
                [] => Err(invalid(tokens)),
                _ => self.handle_get(&args[0], &args[1..]).await,
            },
            _ => Err(Error::InvalidArgument(format!(
                "Invalid command {:?}",
                tokens
            ))),
        }
    }

    async fn handle_reload(&self, verb: &str, args: &[String]) -> Result<Value> {
        let mut restart = verb == "restart";
        let mut unban = false;
        let mut if_exists = false;
        let mut all = false;
        let mut jail: Option<&str> = None;
        for arg in args {
            match arg.as_str() {
                "--restart" => restart = true,
                "--unban" => unban = true,
                "--if-exists" => if_exists = true,
                "--all" => all = true,
                name if jail.is_none() => jail = Some(name),
                _ => return Err(Error::InvalidArgument(format!("Invalid option {:?}", arg))),
            }
        }
        if verb == "restart" && jail.is_none() {
            return Err(Error::InvalidArgument(
                "restart requires a jail name".to_string(),
            ));
        }
        let jail = if all { None } else { jail };
        self.server.reload(jail, restart, unban, if_exists).await?;
        Ok(Value::from("OK"))
    }

    // -- global settings -----------------------------------------------------

    async fn handle_set(&self, target: &str, args: &[String]) -> Result<Value> {
        match target {
            "loglevel" => {
                let level = LogLevel::parse(first(args)?)?;
                self.server.telemetry().set_level(level)?;
                Ok(Value::from(level.name()))
            }
            "logtarget" => {
                let target = LogTarget::parse(first(args)?);
                self.server.telemetry().set_target(target.clone());
                Ok(Value::from(target.name()))
            }
            "syslogsocket" => {
                self.server.telemetry().set_syslog_socket(first(args)?);
                Ok(Value::from(self.server.telemetry().syslog_socket()))
            }
            "dbfile" => {
                let path = first(args)?;
                if path == "None" || path == "none" {
                    self.server.set_db_file(None).await?;
                    Ok(Value::Nil)
                } else {
                    self.server.set_db_file(Some(path.as_str())).await?;
                    Ok(Value::from(path.as_str()))
                }
            }
            "dbmaxmatches" => {
                let value = parse_usize(first(args)?)?;
                self.server.set_db_max_matches(value);
                Ok(Value::from(value))
            }
            "dbpurgeage" => {
                let value = parse_interval(first(args)?)?;
                self.server.set_db_purge_age(value);
                Ok(Value::Int(value))
            }
            "allowipv6" => {
                let token = first(args)?;
                let value = match token.to_ascii_lowercase().as_str() {
                    "auto" => None,
                    other => Some(parse_bool(other)?),
                };
                self.server.set_allow_ipv6(value);
                Ok(Value::from(self.server.allow_ipv6()))
            }
            jail => {
                let jail = self.server.get_jail(jail)?;
                match args {
                    [] => Err(Error::InvalidArgument("Invalid command (no option)".into())),
                    _ => self.set_jail_option(&jail, &args[0], &args[1..]).await,
                }
            }
        }
    }

    async fn handle_get(&self, target: &str, args: &[String]) -> Result<Value> {
        match target {
            "loglevel" => Ok(Value::from(self.server.telemetry().level().name())),
            "logtarget" => Ok(Value::from(self.server.telemetry().target().name())),
            "syslogsocket" => Ok(Value::from(self.server.telemetry().syslog_socket())),
            "dbfile" => Ok(Value::from(self.server.db_file())),
            "dbmaxmatches" => Ok(Value::from(self.server.db_max_matches())),
            "dbpurgeage" => Ok(Value::Int(self.server.db_purge_age())),
            "allowipv6" => Ok(Value::from(self.server.allow_ipv6())),
            jail => {
                let jail = self.server.get_jail(jail)?;
                match args {
                    [] => Err(Error::InvalidArgument("Invalid command (no option)".into())),
                    _ => self.get_jail_option(&jail, &args[0], &args[1..]).await,
                }
            }
        }
    }

    // -- jail settings -------------------------------------------------------

    async fn set_jail_option(&self, jail: &Arc<Jail>, option: &str, args: &[String]) -> Result<Value> {
        match option {
            "idle" => {
                jail.set_idle(parse_bool(first(args)?)?);
                Ok(Value::from(jail.idle()))
            }
            "ignoreself" => {
                let value = parse_bool(first(args)?)?;
                jail.filter().lock().await.set_ignore_self(value);
                Ok(Value::from(value))
            }
            "addignoreip" => {
                let mut filter = jail.filter().lock().await;
                filter.add_ignore_ip(first(args)?)?;
                Ok(Value::list(filter.ignore_ip_list()))
            }
            "delignoreip" => {
                let mut filter = jail.filter().lock().await;
                filter.del_ignore_ip(first(args)?)?;
                Ok(Value::list(filter.ignore_ip_list()))
            }
            "ignorecommand" => {
                let command = args.join(" ");
                jail.filter()
                    .lock()
                    .await
                    .set_ignore_command(Some(command.clone()));
                Ok(Value::from(command))
            }
            "ignorecache" => {
                let spec = args.join(" ");
                let mut filter = jail.filter().lock().await;
                filter.set_ignore_cache(Some(spec.as_str()))?;
                Ok(Value::from(filter.ignore_cache()))
            }
            "addlogpath" => {
                let path = first(args)?;
                let seek = match args.get(1) {
                    Some(token) => SeekTo::parse(token)?,
                    None => SeekTo::Head,
                };
                let mut filter = jail.filter().lock().await;
                filter.add_log_path(path, seek)?;
                Ok(Value::list(filter.log_paths()))
            }
            "dellogpath" => {
                let mut filter = jail.filter().lock().await;
                filter.del_log_path(first(args)?)?;
                Ok(Value::list(filter.log_paths()))
            }
            "logencoding" => {
                let mut filter = jail.filter().lock().await;
                filter.set_log_encoding(first(args)?)?;
                Ok(Value::from(filter.log_encoding()))
            }
            "addjournalmatch" => {
                let mut filter = jail.filter().lock().await;
                filter.add_journal_match(&args.join(" "));
                Ok(Value::list(filter.journal_matches()))
            }
            "deljournalmatch" => {
                let mut filter = jail.filter().lock().await;
                filter.del_journal_match(&args.join(" "))?;
                Ok(Value::list(filter.journal_matches()))
            }
            "addfailregex" => {
                let mut filter = jail.filter().lock().await;
                filter.add_fail_regex(&args.join(" "))?;
                Ok(Value::list(filter.fail_regex_list()))
            }
            "delfailregex" => {
                let mut filter = jail.filter().lock().await;
                filter.del_fail_regex(parse_usize(first(args)?)?)?;
                Ok(Value::list(filter.fail_regex_list()))
            }
            "addignoreregex" => {
                let mut filter = jail.filter().lock().await;
                filter.add_ignore_regex(&args.join(" "))?;
                Ok(Value::list(filter.ignore_regex_list()))
            }
            "delignoreregex" => {
                let mut filter = jail.filter().lock().await;
                filter.del_ignore_regex(parse_usize(first(args)?)?)?;
                Ok(Value::list(filter.ignore_regex_list()))
            }
            "prefregex" => {
                let pattern = args.join(" ");
                jail.filter().lock().await.set_pref_regex(Some(&pattern))?;
                Ok(Value::from(pattern))
            }
            "findtime" => {
                let value = parse_interval(&args.join(" "))?;
                jail.set_find_time(value).await;
                Ok(Value::Int(value))
            }
            "bantime" => {
                let value = parse_interval(&args.join(" "))?;
                jail.set_ban_time(value);
                Ok(Value::Int(value))
            }
            "datepattern" => {
                let mut filter = jail.filter().lock().await;
                filter.set_date_pattern(&args.join(" "))?;
                Ok(Value::from(filter.date_pattern()))
            }
            "usedns" => {
                let value = UseDns::parse(first(args)?)?;
                jail.filter().lock().await.set_use_dns(value);
                Ok(Value::from(value.name()))
            }
            "attempt" => {
                let id = first(args)?;
                let matches = args[1..].to_vec();
                Ok(Value::Int(jail.attempt(id, matches)?))
            }
            "banip" => {
                if args.is_empty() {
                    return Err(Error::InvalidArgument("banip requires at least one IP".into()));
                }
                Ok(Value::from(jail.ban_ips(args, false).await?))
            }
            "unbanip" => {
                let (report_absent, ids) = match args.first().map(String::as_str) {
                    Some("--report-absent") => (true, &args[1..]),
                    _ => (false, args),
                };
                if ids.is_empty() {
                    return Err(Error::InvalidArgument("unbanip requires at least one IP".into()));
                }
                Ok(Value::from(jail.unban_ips(ids, report_absent).await?))
            }
            "maxretry" => {
                let value = parse_u32(first(args)?)?;
                jail.set_max_retry(value);
                Ok(Value::from(value as i64))
            }
            "maxmatches" => {
                let value = parse_usize(first(args)?)?;
                jail.set_max_matches(value);
                Ok(Value::from(value))
            }
            "maxlines" => {
                let value = parse_usize(first(args)?)?;
                if value == 0 {
                    return Err(Error::InvalidArgument("maxlines must be at least 1".into()));
                }
                jail.filter().lock().await.set_max_lines(value);
                Ok(Value::from(value))
            }
            "addaction" => {
                let name = first(args)?;
                let action: Arc<dyn Action> = match args.get(1) {
                    Some(path) => {
                        let kwargs = match args.get(2) {
                            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                                Error::InvalidArgument(format!("invalid action kwargs: {}", e))
                            })?,
                            None => serde_json::Value::Null,
                        };
                        Arc::new(ScriptedAction::new(name.clone(), path.clone(), kwargs)?)
                    }
                    None => Arc::new(CommandAction::new(name.clone())),
                };
                jail.actions().add(jail.name(), name, action)?;
                Ok(Value::list(jail.actions().names()))
            }
            "delaction" => {
                jail.actions().remove(jail.name(), first(args)?)?;
                Ok(Value::list(jail.actions().names()))
            }
            "action" => self.set_action(jail, args).await,
            _ if option.starts_with("bantime.") => self.set_increment(jail, option, args),
            other => Err(Error::InvalidArgument(format!(
                "Invalid jail option {:?}",
                other
            ))),
        }
    }

    fn set_increment(&self, jail: &Arc<Jail>, option: &str, args: &[String]) -> Result<Value> {
        let value = args.join(" ");
        match option {
            "bantime.increment" => {
                let flag = parse_bool(&value)?;
                jail.update_increment(|p| p.enabled = flag);
                Ok(Value::from(flag))
            }
            "bantime.factor" => {
                let factor: f64 = value
                    .parse()
                    .map_err(|_| Error::InvalidArgument(format!("invalid factor {:?}", value)))?;
                jail.update_increment(|p| p.factor = factor);
                Ok(Value::Num(factor))
            }
            "bantime.multipliers" => {
                let multipliers = value
                    .split_whitespace()
                    .map(|t| {
                        t.parse::<i64>().map_err(|_| {
                            Error::InvalidArgument(format!("invalid multiplier {:?}", t))
                        })
                    })
                    .collect::<Result<Vec<i64>>>()?;
                jail.update_increment(|p| {
                    p.multipliers = if multipliers.is_empty() {
                        None
                    } else {
                        Some(multipliers.clone())
                    }
                });
                Ok(Value::from(value))
            }
            "bantime.maxtime" => {
                let value = parse_interval(&value)?;
                jail.update_increment(|p| p.max_time = Some(value));
                Ok(Value::Int(value))
            }
            "bantime.rndtime" => {
                let value = parse_interval(&value)?;
                jail.update_increment(|p| p.rnd_time = Some(value));
                Ok(Value::Int(value))
            }
            "bantime.overalljails" => {
                let flag = parse_bool(&value)?;
                jail.update_increment(|p| p.overall_jails = flag);
                Ok(Value::from(flag))
            }
            other => Err(Error::InvalidArgument(format!(
                "Invalid jail option {:?}",
                other
            ))),
        }
    }

    async fn set_action(&self, jail: &Arc<Jail>, args: &[String]) -> Result<Value> {
        let name = first(args)?;
        let action = jail.actions().get(jail.name(), name)?;
        let Some(key) = args.get(1) else {
            return Err(Error::InvalidArgument("Invalid command (no option)".into()));
        };
        let rest = &args[2..];

        // a known method name is an invocation, everything else a property;
        // scripted actions additionally accept any custom method name as
        // long as the argument looks like JSON kwargs (or is absent)
        let is_method = action.methods().iter().any(|m| m == key)
            || (action.kind() == "script"
                && action.get_property(key).is_none()
                && rest.first().map(|r| r.starts_with('{')).unwrap_or(true));
        if is_method {
            let kwargs = match rest.first() {
                Some(raw) if raw.starts_with('{') => serde_json::from_str(raw)
                    .map_err(|e| Error::InvalidArgument(format!("invalid kwargs: {}", e)))?,
                Some(_) => {
                    return Err(Error::InvalidArgument(format!(
                        "method {:?} takes JSON kwargs only",
                        key
                    )))
                }
                None => serde_json::Value::Null,
            };
            let info = crate::action::ActionInfo::jail_only(jail.name(), jail.ban_time());
            let output = action.invoke(key, kwargs, &info).await?;
            return Ok(Value::from(output));
        }

        let value = rest.join(" ");
        if rest.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "property {:?} requires a value",
                key
            )));
        }
        action.set_property(key, &value);
        Ok(Value::from(value))
    }

    async fn get_jail_option(&self, jail: &Arc<Jail>, option: &str, args: &[String]) -> Result<Value> {
        match option {
            "idle" => Ok(Value::from(jail.idle())),
            "backend" => Ok(Value::from(jail.backend())),
            "ignoreself" => Ok(Value::from(jail.filter().lock().await.ignore_self())),
            "ignoreip" => Ok(Value::list(jail.filter().lock().await.ignore_ip_list())),
            "ignorecommand" => Ok(Value::from(
                jail.filter().lock().await.ignore_command().unwrap_or(""),
            )),
            "ignorecache" => Ok(Value::from(jail.filter().lock().await.ignore_cache())),
            "logpath" => Ok(Value::list(jail.filter().lock().await.log_paths())),
            "logencoding" => Ok(Value::from(jail.filter().lock().await.log_encoding())),
            "journalmatch" => Ok(Value::list(jail.filter().lock().await.journal_matches())),
            "prefregex" => Ok(Value::from(jail.filter().lock().await.pref_regex())),
            "failregex" => Ok(Value::list(jail.filter().lock().await.fail_regex_list())),
            "ignoreregex" => Ok(Value::list(jail.filter().lock().await.ignore_regex_list())),
            "findtime" => Ok(Value::Int(jail.find_time())),
            "bantime" => Ok(Value::Int(jail.ban_time())),
            "datepattern" => Ok(Value::from(jail.filter().lock().await.date_pattern())),
            "usedns" => Ok(Value::from(jail.filter().lock().await.use_dns().name())),
            "maxretry" => Ok(Value::from(jail.max_retry() as i64)),
            "maxmatches" => Ok(Value::from(jail.max_matches())),
            "maxlines" => Ok(Value::from(jail.filter().lock().await.max_lines())),
            "actions" => Ok(Value::list(jail.actions().names())),
            "banned" => match args {
                [] => Ok(Value::list(jail.banned_ids())),
                [id] => Ok(Value::Int(jail.is_banned(id) as i64)),
                ids => Ok(Value::List(
                    ids.iter()
                        .map(|id| Value::Int(jail.is_banned(id) as i64))
                        .collect(),
                )),
            },
            "banip" => match args.first().map(String::as_str) {
                None => Ok(Value::list(jail.banned_ids())),
                Some("--with-time") => Ok(Value::list(jail.banned_ids_with_time())),
                Some(sep) => Ok(Value::from(jail.banned_ids().join(sep))),
            },
            "actionproperties" => {
                let action = jail.actions().get(jail.name(), first(args)?)?;
                Ok(Value::list(action.properties()))
            }
            "actionmethods" => {
                let action = jail.actions().get(jail.name(), first(args)?)?;
                Ok(Value::list(action.methods()))
            }
            "action" => {
                let name = first(args)?;
                let action = jail.actions().get(jail.name(), name)?;
                let key = args
                    .get(1)
                    .ok_or_else(|| Error::InvalidArgument("Invalid command (no option)".into()))?;
                match action.get_property(key) {
                    Some(value) => Ok(Value::from(value)),
                    None => Ok(Value::Nil),
                }
            }
            "bantime.increment" => Ok(Value::from(jail.increment().enabled)),
            "bantime.factor" => Ok(Value::Num(jail.increment().factor)),
            "bantime.multipliers" => Ok(Value::from(
                jail.increment()
                    .multipliers
                    .map(|m| m.iter().map(i64::to_string).collect::<Vec<_>>().join(" ")),
            )),
            "bantime.maxtime" => Ok(Value::from(jail.increment().max_time)),
            "bantime.rndtime" => Ok(Value::from(jail.increment().rnd_time)),
            "bantime.overalljails" => Ok(Value::from(jail.increment().overall_jails)),
            other => Err(Error::InvalidArgument(format!(
                "Invalid jail option {:?}",
                other
            ))),
        }
    }
}

fn invalid(tokens: &[String]) -> Error {
    Error::InvalidArgument(format!("Invalid command {:?}", tokens))
}

fn first(args: &[String]) -> Result<&String> {
    args.first()
        .ok_or_else(|| Error::InvalidArgument("Invalid command (missing argument)".into()))
}

fn parse_usize(token: &str) -> Result<usize> {
    token
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid number {:?}", token)))
}

fn parse_u32(token: &str) -> Result<u32> {
    token
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("invalid number {:?}", token)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Telemetry;

    fn transmitter() -> Transmitter {
        Transmitter::new(Server::new(Telemetry::disabled()))
    }

    async fn run(t: &Transmitter, tokens: &[&str]) -> Reply {
        t.handle(&CommandFrame::from(tokens)).await
    }

    #[tokio::test]
    async fn test_ping_echo_version() {
        let t = transmitter();
        assert_eq!(run(&t, &["ping"]).await, Reply::ok("pong"));
        assert_eq!(
            run(&t, &["echo", "a", "b"]).await,
            Reply::ok(Value::list(["a", "b"]))
        );
        let version = run(&t, &["version"]).await;
        assert!(version.is_ok());
        assert!(version.value.as_str().unwrap().starts_with("jaild "));
    }

    #[tokio::test]
    async fn test_unknown_verb_is_code_one() {
        let t = transmitter();
        let reply = run(&t, &["frobnicate"]).await;
        assert_eq!(reply.code, 1);
    }

    #[tokio::test]
    async fn test_add_set_get_cycle() {
        let t = transmitter();
        assert_eq!(run(&t, &["add", "ssh", "polling"]).await, Reply::ok("ssh"));

        // interval grammar on bantime
        let reply = run(&t, &["set", "ssh", "bantime", "15d 5h 30m"]).await;
        assert_eq!(reply, Reply::ok(Value::Int(1_315_800)));
        assert_eq!(
            run(&t, &["get", "ssh", "bantime"]).await,
            Reply::ok(Value::Int(1_315_800))
        );

        assert!(run(&t, &["set", "ssh", "maxretry", "5"]).await.is_ok());
        assert_eq!(
            run(&t, &["get", "ssh", "maxretry"]).await,
            Reply::ok(Value::Int(5))
        );

        // unknown jail
        let reply = run(&t, &["get", "nope", "bantime"]).await;
        assert_eq!(reply.code, 1);
        assert_eq!(
            reply.value.as_str().unwrap(),
            "Sorry but the jail 'nope' does not exist"
        );
    }

    #[tokio::test]
    async fn test_failregex_roundtrip() {
        let t = transmitter();
        run(&t, &["add", "ssh", "polling"]).await;
        let reply = run(&t, &["set", "ssh", "addfailregex", "^test <HOST> group$"]).await;
        assert_eq!(
            reply,
            Reply::ok(Value::list(["^test <HOST> group$"]))
        );
        // bad regex is a code-1 reply, not a crash
        assert_eq!(run(&t, &["set", "ssh", "addfailregex", "broken("]).await.code, 1);
        // index deletion
        assert!(run(&t, &["set", "ssh", "delfailregex", "0"]).await.is_ok());
        assert_eq!(run(&t, &["set", "ssh", "delfailregex", "0"]).await.code, 1);
    }

    #[tokio::test]
    async fn test_banip_flow() {
        let t = transmitter();
        run(&t, &["add", "ssh", "polling"]).await;
        run(&t, &["start", "ssh"]).await;

        let reply = run(
            &t,
            &["set", "ssh", "banip", "192.0.2.1", "192.0.2.1", "192.0.2.2"],
        )
        .await;
        assert_eq!(reply, Reply::ok(Value::Int(2)));
        assert_eq!(
            run(&t, &["set", "ssh", "banip", "192.0.2.1"]).await,
            Reply::ok(Value::Int(0))
        );

        assert_eq!(
            run(&t, &["get", "ssh", "banned", "192.0.2.1"]).await,
            Reply::ok(Value::Int(1))
        );
        assert_eq!(
            run(&t, &["get", "ssh", "banned", "192.0.2.9"]).await,
            Reply::ok(Value::Int(0))
        );

        let reply = run(&t, &["set", "ssh", "unbanip", "192.0.2.1", "192.0.2.2"]).await;
        assert_eq!(reply, Reply::ok(Value::Int(2)));
        run(&t, &["stop", "ssh"]).await;
    }

    #[tokio::test]
    async fn test_action_properties_and_introspection() {
        let t = transmitter();
        run(&t, &["add", "ssh", "polling"]).await;
        assert!(run(&t, &["set", "ssh", "addaction", "firewall"]).await.is_ok());
        assert!(
            run(&t, &["set", "ssh", "action", "firewall", "actionban", "echo ban <ip>"])
                .await
                .is_ok()
        );
        assert_eq!(
            run(&t, &["get", "ssh", "action", "firewall", "actionban"]).await,
            Reply::ok("echo ban <ip>")
        );
        let methods = run(&t, &["get", "ssh", "actionmethods", "firewall"]).await;
        assert!(methods.value.to_string().contains("ban"));

        assert_eq!(run(&t, &["set", "ssh", "delaction", "missing"]).await.code, 1);
        assert!(run(&t, &["set", "ssh", "delaction", "firewall"]).await.is_ok());
    }

    #[tokio::test]
    async fn test_loglevel_and_allowipv6() {
        let t = transmitter();
        assert_eq!(
            run(&t, &["set", "loglevel", "DEBUG"]).await,
            Reply::ok("DEBUG")
        );
        assert_eq!(run(&t, &["get", "loglevel"]).await, Reply::ok("DEBUG"));
        assert_eq!(run(&t, &["set", "loglevel", "NOPE"]).await.code, 1);

        assert_eq!(run(&t, &["set", "allowipv6", "on"]).await, Reply::ok("yes"));
        assert_eq!(run(&t, &["get", "allowipv6"]).await, Reply::ok("yes"));
        assert_eq!(run(&t, &["set", "allowipv6", "auto"]).await, Reply::ok("auto"));
    }
}
