use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use job_server_core::{HandlerRecord, Job, JobId, JobStatus};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "jsctl")]
#[command(about = "Job Server Admin CLI", long_about = None)]
struct Args {
    /// REST API address
    #[arg(long, env = "JSCTL_API", default_value = "http://127.0.0.1:8080")]
    api: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a new job
    Submit {
        /// Registered handler name
        #[arg(long)]
        handler: String,

        /// Attempt budget (at least 1)
        #[arg(short, long, default_value = "3")]
        max_attempts: u32,
    },

    /// Get job status
    Status {
        /// Job ID
        job_id: JobId,
    },

    /// List jobs
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<JobStatus>,
    },

    /// Cancel a job that has not finished yet
    Cancel {
        /// Job ID
        job_id: JobId,
    },

    /// List registered handlers
    Handlers,

    /// Show server health
    Health,
}

/// Thin wrapper over the REST API that turns `{"error": ...}` bodies into errors
struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    fn new(base: &str) -> Self {
        ApiClient {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let request = self.http.get(format!("{}{}", self.base, path));
        Self::send(request).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> anyhow::Result<T> {
        let request = self.http.post(format!("{}{}", self.base, path)).json(body);
        Self::send(request).await
    }

    async fn patch<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> anyhow::Result<T> {
        let request = self.http.patch(format!("{}{}", self.base, path)).json(body);
        Self::send(request).await
    }

    async fn send<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> anyhow::Result<T> {
        let response = request.send().await.context("Failed to reach job server")?;
        let status = response.status();

        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body["error"].as_str().unwrap_or("no error message");
            bail!("{} ({})", message, status);
        }

        Ok(response.json().await?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = ApiClient::new(&args.api);

    match args.command {
        Commands::Submit { handler, max_attempts } => {
            let job: Job = client
                .post("/api/jobs", &json!({ "handler": handler, "max_attempts": max_attempts }))
                .await?;

            match args.format {
                OutputFormat::Table => println!("Job submitted: {}", job.id),
                format => print_structured(format, &job)?,
            }
        }

        Commands::Status { job_id } => {
            let job: Job = client.get(&format!("/api/jobs/{}", job_id)).await?;

            match args.format {
                OutputFormat::Table => println!("{}", job_table(&job)),
                format => print_structured(format, &job)?,
            }
        }

        Commands::List { status } => {
            let path = match status {
                Some(status) => format!("/api/jobs?status={}", status),
                None => "/api/jobs".to_string(),
            };
            let jobs: Vec<Job> = client.get(&path).await?;

            match args.format {
                OutputFormat::Table => println!("{}", jobs_table(&jobs)),
                format => print_structured(format, &jobs)?,
            }
        }

        Commands::Cancel { job_id } => {
            let job: Job = client
                .patch(&format!("/api/jobs/{}", job_id), &json!({ "status": JobStatus::Failed }))
                .await?;

            match args.format {
                OutputFormat::Table => println!("Job {} cancelled", job.id),
                format => print_structured(format, &job)?,
            }
        }

        Commands::Handlers => {
            let handlers: Vec<HandlerRecord> = client.get("/api/handlers").await?;

            match args.format {
                OutputFormat::Table => println!("{}", handlers_table(&handlers)),
                format => print_structured(format, &handlers)?,
            }
        }

        Commands::Health => {
            let response: serde_json::Value = client.get("/health").await?;

            match args.format {
                OutputFormat::Table => {
                    let mut table = Table::new();
                    table.load_preset(UTF8_FULL);
                    table.set_header(vec!["Property", "Value"]);
                    table.add_row(vec!["Status", response["status"].as_str().unwrap_or("unknown")]);
                    table.add_row(vec!["Queue Depth", &response["queue_depth"].to_string()]);
                    table.add_row(vec!["In Flight", &response["in_flight"].to_string()]);
                    println!("{table}");
                }
                format => print_structured(format, &response)?,
            }
        }
    }

    Ok(())
}

fn print_structured<T: Serialize>(format: OutputFormat, value: &T) -> anyhow::Result<()> {
    match format {
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn job_table(job: &Job) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["ID", &job.id.to_string()]);
    table.add_row(vec!["Handler", &job.handler]);
    table.add_row(vec!["Status", job.status.as_str()]);
    table.add_row(vec![
        "Attempts",
        &format!("{}/{}", job.attempts, job.max_attempts),
    ]);
    table.add_row(vec!["Created", &job.created_at.to_rfc3339()]);
    table.add_row(vec!["Updated", &job.updated_at.to_rfc3339()]);
    if let Some(error) = &job.error {
        table.add_row(vec!["Error", error]);
    }
    table
}

fn jobs_table(jobs: &[Job]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Handler", "Status", "Attempts", "Last Error"]);
    for job in jobs {
        table.add_row(vec![
            job.id.to_string(),
            job.handler.clone(),
            job.status.to_string(),
            format!("{}/{}", job.attempts, job.max_attempts),
            job.error.clone().unwrap_or_default(),
        ]);
    }
    table
}

fn handlers_table(handlers: &[HandlerRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Name"]);
    for handler in handlers {
        table.add_row(vec![handler.id.to_string(), handler.name.clone()]);
    }
    table
}
