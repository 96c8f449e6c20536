use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use taskwatch_broker::{MessageBroker, SqliteBroker, StreamConfig};
use taskwatch_core::subject::{TASKS_STREAM, TASKS_STREAM_SUBJECTS};
use taskwatch_db::{open_database, Database};
use taskwatch_notify::{
    consume, DirectoryEmailResolver, EmailClient, EmailNotifier, EmailResolver,
    NotificationHandler, NullEmailClient, NullEmailResolver, SmtpEmailClient, UiNotifier,
};
use taskwatch_store::{create_store, AttachmentStore};

use crate::checker::Checker;
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmailBackend {
    Null,
    Smtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Module {
    Checker,
    EmailNotifier(EmailBackend),
    UiNotifier,
}

impl Module {
    pub fn name(&self) -> &'static str {
        match self {
            Module::Checker => "checker",
            Module::EmailNotifier(EmailBackend::Null) => "emailnotifier:null",
            Module::EmailNotifier(EmailBackend::Smtp) => "emailnotifier:smtp",
            Module::UiNotifier => "uinotifier",
        }
    }

    /// Modules sharing a slot cannot run together.
    fn slot(&self) -> &'static str {
        match self {
            Module::Checker => "checker",
            Module::EmailNotifier(_) => "emailnotifier",
            Module::UiNotifier => "uinotifier",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Module {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "checker" => Ok(Module::Checker),
            "emailnotifier:null" => Ok(Module::EmailNotifier(EmailBackend::Null)),
            "emailnotifier:smtp" => Ok(Module::EmailNotifier(EmailBackend::Smtp)),
            "uinotifier" => Ok(Module::UiNotifier),
            other => bail!("unknown module '{other}'"),
        }
    }
}

/// Parse the configured module list. Blank entries are ignored; unknown
/// names and two modules for the same slot are errors.
pub fn parse_modules(names: &[String]) -> Result<Vec<Module>> {
    let mut modules = Vec::new();
    let mut slots = HashSet::new();
    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let module: Module = name.parse()?;
        if !slots.insert(module.slot()) {
            bail!("module '{name}' conflicts with another {} module", module.slot());
        }
        modules.push(module);
    }
    if modules.is_empty() {
        bail!("no modules configured");
    }
    Ok(modules)
}

/// Shared backends every module is built from.
pub struct Components {
    pub db: Arc<dyn Database>,
    pub attachments: AttachmentStore,
    pub broker: Arc<dyn MessageBroker>,
}

impl Components {
    pub async fn open(config: &Config) -> Result<Self> {
        let db = open_database(&config.db_config())
            .await
            .context("opening task store")?;
        let blobs = create_store(&config.store_config()).context("opening blob store")?;
        let broker_config = config.broker_config().map_err(|e| anyhow!(e))?;
        let broker = SqliteBroker::open(&broker_config).context("opening broker")?;
        Ok(Self {
            db,
            attachments: AttachmentStore::new(blobs),
            broker: Arc::new(broker),
        })
    }
}

enum Runnable {
    Checker(Checker),
    Consumer(Arc<dyn NotificationHandler>),
}

/// Running modules plus the backends they share.
pub struct App {
    cancel: CancellationToken,
    tasks: Vec<(Module, JoinHandle<()>)>,
    components: Components,
}

impl App {
    /// Build every configured module, then start them. Nothing is spawned
    /// when any module fails to build.
    pub async fn start(config: &Config, components: Components) -> Result<Self> {
        let modules = parse_modules(&config.modules)?;
        components
            .broker
            .add_stream(&StreamConfig::new(TASKS_STREAM, &[TASKS_STREAM_SUBJECTS]))
            .await
            .context("creating tasks stream")?;

        let mut built = Vec::with_capacity(modules.len());
        for module in modules {
            let runnable = build(module, config, &components)
                .with_context(|| format!("building module {module}"))?;
            built.push((module, runnable));
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(built.len());
        for (module, runnable) in built {
            let cancel = cancel.clone();
            let handle = match runnable {
                Runnable::Checker(checker) => {
                    tokio::spawn(async move { checker.run(cancel).await })
                }
                Runnable::Consumer(handler) => {
                    let broker = components.broker.clone();
                    tokio::spawn(async move {
                        if let Err(e) = consume(broker, handler, cancel).await {
                            error!("module {module} stopped with error: {e}");
                        }
                    })
                }
            };
            info!("module {module} started");
            tasks.push((module, handle));
        }

        Ok(Self {
            cancel,
            tasks,
            components,
        })
    }

    pub fn modules(&self) -> Vec<Module> {
        self.tasks.iter().map(|(m, _)| *m).collect()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every module, wait for them, then close the broker and the
    /// task store in that order.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.cancel.cancel();
        for (module, handle) in self.tasks {
            if let Err(e) = handle.await {
                error!("module {module} ended abnormally: {e}");
            }
        }
        self.components.broker.close().await;
        self.components.db.close().await;
        info!("shutdown complete");
    }
}

fn build(module: Module, config: &Config, components: &Components) -> Result<Runnable> {
    Ok(match module {
        Module::Checker => Runnable::Checker(Checker::new(
            components.db.clone(),
            components.broker.clone(),
            components.attachments.clone(),
            config.checker_config().map_err(|e| anyhow!(e))?,
        )),
        Module::EmailNotifier(backend) => {
            let client: Arc<dyn EmailClient> = match backend {
                EmailBackend::Null => Arc::new(NullEmailClient),
                EmailBackend::Smtp => {
                    if config.directory_url.is_none() {
                        bail!("--directory-url is required to send email over SMTP");
                    }
                    let smtp = config.smtp_config().map_err(|e| anyhow!(e))?;
                    Arc::new(SmtpEmailClient::new(&smtp)?)
                }
            };
            Runnable::Consumer(Arc::new(EmailNotifier::new(email_resolver(config)?, client)))
        }
        Module::UiNotifier => {
            Runnable::Consumer(Arc::new(UiNotifier::new(components.broker.clone())))
        }
    })
}

fn email_resolver(config: &Config) -> Result<Arc<dyn EmailResolver>> {
    let Some(url) = &config.directory_url else {
        return Ok(Arc::new(NullEmailResolver));
    };
    let token = config
        .directory_token
        .as_deref()
        .context("--directory-token is required with --directory-url")?;
    Ok(Arc::new(DirectoryEmailResolver::new(url, token)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_known_modules() {
        let modules =
            parse_modules(&names(&["checker", " emailnotifier:smtp ", "uinotifier", ""]))
                .unwrap();
        assert_eq!(
            modules,
            vec![
                Module::Checker,
                Module::EmailNotifier(EmailBackend::Smtp),
                Module::UiNotifier
            ]
        );
    }

    #[test]
    fn rejects_unknown_module() {
        let err = parse_modules(&names(&["checker", "pager"])).unwrap_err();
        assert!(err.to_string().contains("pager"));
    }

    #[test]
    fn rejects_two_email_backends() {
        assert!(parse_modules(&names(&["emailnotifier:null", "emailnotifier:smtp"])).is_err());
        assert!(parse_modules(&names(&["checker", "checker"])).is_err());
    }

    #[test]
    fn rejects_empty_list() {
        assert!(parse_modules(&names(&[" ", ""])).is_err());
    }

    #[test]
    fn module_names_round_trip() {
        for name in ["checker", "emailnotifier:null", "emailnotifier:smtp", "uinotifier"] {
            assert_eq!(name.parse::<Module>().unwrap().name(), name);
        }
    }
}
