use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::Term;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::api::{ApiClient, Resource, StartBuild};
use crate::auth::Token;
use crate::config::{self, Config, OutputConfig, OutputFormat, ServerConfig, WaterfallConfig};
use crate::events::Status;
use crate::output::{self, PhaseProgress};
use crate::session::{self, WaterfallSession};
use crate::transport::{Connector, EventBus, Topic};
use crate::waterfall::{builders_of, seed_events, WaterfallModel};

#[derive(Parser)]
#[command(name = "buildwatch")]
#[command(author, version, about = "Live CI build waterfall", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./buildwatch.toml or the user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "BUILDWATCH_API_URL")]
    api_url: Option<String>,

    #[arg(long, global = true, env = "BUILDWATCH_WS_URL")]
    ws_url: Option<String>,

    #[arg(short, long, global = true, env = "BUILDWATCH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Write JSON output to this file instead of stdout
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    #[arg(short, long, global = true, value_enum)]
    format: Option<OutputFormat>,

    #[arg(short, long, global = true, default_value_t = false)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a repository's waterfall live until interrupted
    Watch {
        #[arg(short, long)]
        repo: String,

        /// Show the tail of each step's output
        #[arg(long)]
        show_output: bool,

        /// Only print the final view
        #[arg(long)]
        no_redraw: bool,
    },
    /// Rebuild a waterfall from recorded frames, one JSON event per line
    Replay {
        file: PathBuf,

        /// Label for the rendered view
        #[arg(short, long)]
        repo: Option<String>,
    },
    /// Print repository status changes as they arrive
    Status {
        #[arg(short, long)]
        repo: String,
    },
    /// Ask the server to start builds for a repository
    StartBuild {
        #[arg(short, long)]
        repo: String,

        #[arg(short, long)]
        branch: Option<String>,

        /// Builder to run; repeat for several, omit for all
        #[arg(long = "builder")]
        builders: Vec<String>,

        #[arg(long)]
        named_tree: Option<String>,
    },
    /// Cancel a pending or running build
    CancelBuild {
        #[arg(short, long)]
        repo: String,

        #[arg(short = 'B', long)]
        build: String,
    },
    /// List a repository's buildsets, newest first
    Buildsets {
        #[arg(short, long)]
        repo: String,
    },
    /// Read or change records of a REST collection
    Resource {
        #[command(subcommand)]
        action: ResourceAction,
    },
    /// Write the current settings to a config file
    InitConfig {
        /// Target file (defaults to the user config); .json and .yaml are honoured
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ResourceAction {
    List {
        #[arg(value_enum)]
        kind: Resource,

        /// Query filter as key=value; repeatable
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    Get {
        #[arg(value_enum)]
        kind: Resource,
        id: String,
    },
    Create {
        #[arg(value_enum)]
        kind: Resource,

        /// JSON body
        #[arg(long)]
        data: String,
    },
    Update {
        #[arg(value_enum)]
        kind: Resource,
        id: String,

        /// JSON body
        #[arg(long)]
        data: String,
    },
    Delete {
        #[arg(value_enum)]
        kind: Resource,
        id: String,
    },
}

fn parse_filter(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn parse_body(data: &str) -> Result<serde_json::Value> {
    serde_json::from_str(data).context("--data must be a JSON document")
}

/// Config file values with command-line and environment overrides applied.
struct Settings {
    api_url: String,
    ws_url: String,
    token: Option<Token>,
    waterfall: WaterfallConfig,
    format: OutputFormat,
    pretty: bool,
}

impl Settings {
    fn to_config(&self) -> Config {
        Config {
            server: ServerConfig {
                api_url: self.api_url.clone(),
                ws_url: self.ws_url.clone(),
                token: self.token.as_ref().map(|token| token.as_str().to_string()),
            },
            waterfall: self.waterfall.clone(),
            output: OutputConfig {
                format: self.format,
                pretty: self.pretty,
            },
        }
    }
}

impl Cli {
    fn settings(&self) -> Result<Settings> {
        let config = Config::load(self.config.as_deref())?;
        Ok(self.merge(config))
    }

    fn merge(&self, config: Config) -> Settings {
        let Config {
            server,
            waterfall,
            output,
        } = config;

        Settings {
            api_url: self.api_url.clone().unwrap_or(server.api_url),
            ws_url: self.ws_url.clone().unwrap_or(server.ws_url),
            token: self
                .token
                .clone()
                .or(server.token)
                .map(Token::from),
            waterfall,
            format: self.format.unwrap_or(output.format),
            pretty: self.pretty || output.pretty,
        }
    }

    fn emit<T: Serialize>(&self, value: &T, pretty: bool) -> Result<()> {
        if let Some(output_path) = &self.output {
            let mut file = std::fs::File::create(output_path)
                .with_context(|| format!("Failed to create {}", output_path.display()))?;
            output::export_json(value, pretty, &mut file)?;
            info!("Output written to: {}", output_path.display());
        } else {
            output::export_json(value, pretty, &mut std::io::stdout().lock())?;
        }
        Ok(())
    }

    fn present(&self, settings: &Settings, model: &WaterfallModel, show_output: bool) -> Result<()> {
        match settings.format {
            OutputFormat::Summary if self.output.is_none() => {
                output::print_waterfall(model, show_output);
                Ok(())
            }
            _ => self.emit(model, settings.pretty),
        }
    }

    async fn execute_watch(
        &self,
        settings: &Settings,
        repo: &str,
        show_output: bool,
        no_redraw: bool,
    ) -> Result<()> {
        info!("Watching waterfall for repository: {}", repo);

        let api = ApiClient::new(&settings.api_url, settings.token.clone())?;
        let ws_url = Url::parse(&settings.ws_url)
            .with_context(|| format!("Invalid websocket URL: {}", settings.ws_url))?;
        let connector = Connector::new(ws_url, settings.token.clone());

        let progress = PhaseProgress::start_phase_1(repo);
        let feed = match session::subscribe(&connector, repo).await {
            Ok(feed) => feed,
            Err(e) => {
                progress.abandon("Phase 1/2: Connection failed ✗");
                return Err(e).context("Failed to subscribe to the waterfall feed");
            }
        };
        let progress = progress.finish_phase_1_start_phase_2();

        let mut buildsets = match api.list_buildsets(repo).await {
            Ok(buildsets) => buildsets,
            Err(e) => {
                output::print_error_banner(format!("Could not fetch buildsets: {e}"));
                Vec::new()
            }
        };
        // Rows are appended as they arrive, so seed oldest first.
        buildsets.reverse();
        progress.finish_phase_2(buildsets.len());

        let model = WaterfallModel::new(builders_of(&buildsets)).with_repository(repo);
        let seed = seed_events(&buildsets);
        let session = WaterfallSession::start(
            &connector,
            feed,
            model,
            seed,
            settings.waterfall.max_output_bytes,
        );

        let show_output = show_output || settings.waterfall.show_output;
        let redraw = settings.waterfall.redraw && !no_redraw;
        let term = Term::stdout();

        let (model, stranded) = session
            .run(
                |model| {
                    if !redraw {
                        return;
                    }
                    if let Err(e) = term.clear_screen() {
                        debug!("Could not clear terminal: {e}");
                    }
                    print!("{}", output::render_waterfall(model, show_output));
                },
                async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!("Could not listen for Ctrl-C: {e}");
                        std::future::pending::<()>().await;
                    }
                },
            )
            .await;

        if stranded.total() > 0 {
            warn!(
                "{} events never applied (step starts: {}, step finishes: {}, build starts: {}, build finishes: {})",
                stranded.total(),
                stranded.step_started,
                stranded.step_finished,
                stranded.build_started,
                stranded.build_finished,
            );
        }

        if !redraw || settings.format == OutputFormat::Json || self.output.is_some() {
            self.present(settings, &model, show_output)?;
        }
        Ok(())
    }

    fn execute_replay(&self, settings: &Settings, file: &Path, repo: Option<&str>) -> Result<()> {
        let frames = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read recorded frames: {}", file.display()))?;

        let mut model = WaterfallModel::default();
        if let Some(repo) = repo {
            model = model.with_repository(repo);
        }

        let (model, stranded) =
            session::replay(model, &frames, settings.waterfall.max_output_bytes);
        if stranded.total() > 0 {
            warn!("{} recorded events never applied", stranded.total());
        }
        self.present(settings, &model, settings.waterfall.show_output)
    }

    async fn execute_status(&self, settings: &Settings, repo: &str) -> Result<()> {
        let ws_url = Url::parse(&settings.ws_url)
            .with_context(|| format!("Invalid websocket URL: {}", settings.ws_url))?;

        let bus = EventBus::default();
        let mut listener = bus.listen_to("repo_status_changed");
        let connector = Connector::new(ws_url, settings.token.clone()).with_bus(bus);
        let subscription = connector
            .connect(Topic::RepoStatus {
                repo_id: repo.to_string(),
            })
            .await
            .context("Failed to subscribe to repository status")?;
        // The socket task now holds the only publisher, so the listener ends
        // when the server hangs up.
        drop(connector);

        let feed = subscription.on_event(|notice| debug!("Received {}", notice.event_type));

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                notice = listener.recv() => {
                    let Some(notice) = notice else { break };
                    match settings.format {
                        OutputFormat::Json => self.emit(&notice.payload, settings.pretty)?,
                        OutputFormat::Summary => {
                            let raw = notice
                                .payload
                                .get("status")
                                .and_then(|status| status.as_str())
                                .unwrap_or("unknown");
                            let status: Status = serde_json::from_value(raw.into())
                                .unwrap_or(Status::Unknown);
                            println!(
                                "{} {} {}",
                                output::dim(chrono::Local::now().format("%H:%M:%S")),
                                repo,
                                output::by_status(status, raw)
                            );
                        }
                    }
                }
            }
        }

        feed.abort();
        Ok(())
    }

    async fn execute_start_build(
        &self,
        settings: &Settings,
        repo: &str,
        request: StartBuild,
    ) -> Result<()> {
        let api = ApiClient::new(&settings.api_url, settings.token.clone())?;
        let response = api
            .start_build(repo, &request)
            .await
            .with_context(|| format!("Failed to start builds for {repo}"))?;

        match settings.format {
            OutputFormat::Json => self.emit(&response, settings.pretty),
            OutputFormat::Summary => {
                let branch = request.branch.as_deref().unwrap_or("default branch");
                println!("{} Builds requested on {}", output::bright_green("✓"), branch);
                Ok(())
            }
        }
    }

    async fn execute_cancel_build(&self, settings: &Settings, repo: &str, build: &str) -> Result<()> {
        let api = ApiClient::new(&settings.api_url, settings.token.clone())?;
        let response = api
            .cancel_build(repo, build)
            .await
            .with_context(|| format!("Failed to cancel build {build}"))?;

        match settings.format {
            OutputFormat::Json => self.emit(&response, settings.pretty),
            OutputFormat::Summary => {
                println!("{} Cancellation requested for {}", output::bright_green("✓"), build);
                Ok(())
            }
        }
    }

    async fn execute_buildsets(&self, settings: &Settings, repo: &str) -> Result<()> {
        let api = ApiClient::new(&settings.api_url, settings.token.clone())?;
        let buildsets = api
            .list_buildsets(repo)
            .await
            .with_context(|| format!("Failed to list buildsets for {repo}"))?;

        match settings.format {
            OutputFormat::Summary if self.output.is_none() => {
                output::print_buildsets(&buildsets);
                Ok(())
            }
            _ => self.emit(&buildsets, settings.pretty),
        }
    }

    async fn execute_resource(&self, settings: &Settings, action: &ResourceAction) -> Result<()> {
        let api = ApiClient::new(&settings.api_url, settings.token.clone())?;

        let response = match action {
            ResourceAction::List { kind, filters } => {
                let filters: Vec<(&str, &str)> = filters
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str()))
                    .collect();
                let items: Vec<serde_json::Value> = api.list(*kind, &filters).await?;
                serde_json::Value::Array(items)
            }
            ResourceAction::Get { kind, id } => api.get(*kind, id).await?,
            ResourceAction::Create { kind, data } => api.create(*kind, &parse_body(data)?).await?,
            ResourceAction::Update { kind, id, data } => {
                api.update(*kind, id, &parse_body(data)?).await?
            }
            ResourceAction::Delete { kind, id } => {
                api.delete(*kind, id).await?;
                info!("Deleted {} {}", kind.path().trim_end_matches('/'), id);
                return Ok(());
            }
        };

        self.emit(&response, settings.pretty)
    }

    fn execute_init_config(&self, settings: &Settings, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config::user_config_path()
                .context("No user config directory on this platform; pass a path")?,
        };
        settings.to_config().save(&path)?;
        println!("{} {}", output::bright_green("Wrote"), path.display());
        Ok(())
    }

    pub async fn execute(&self) -> Result<()> {
        let settings = self.settings()?;

        match &self.command {
            Commands::Watch {
                repo,
                show_output,
                no_redraw,
            } => {
                self.execute_watch(&settings, repo, *show_output, *no_redraw)
                    .await
            }
            Commands::Replay { file, repo } => {
                self.execute_replay(&settings, file, repo.as_deref())
            }
            Commands::Status { repo } => self.execute_status(&settings, repo).await,
            Commands::StartBuild {
                repo,
                branch,
                builders,
                named_tree,
            } => {
                let request = StartBuild {
                    branch: branch.clone(),
                    builders_names: builders.clone(),
                    named_tree: named_tree.clone(),
                };
                self.execute_start_build(&settings, repo, request).await
            }
            Commands::CancelBuild { repo, build } => {
                self.execute_cancel_build(&settings, repo, build).await
            }
            Commands::Buildsets { repo } => self.execute_buildsets(&settings, repo).await,
            Commands::Resource { action } => self.execute_resource(&settings, action).await,
            Commands::InitConfig { path } => self.execute_init_config(&settings, path.as_deref()),
        }
    }
}
