use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use common::{
    Dataset, Model, ResultArtifact, TaskId, TaskPage, TaskSnapshot, TaskStatus, TrainingConfig,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::env;
use std::time::Duration;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "timevis")]
#[command(about = "CLI para mandar y seguir tasks de forecasting en el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Entrena un modelo sobre un dataset registrado
    Train {
        #[arg(value_name = "DATASET_ID")]
        dataset_id: u64,
        /// recurrent (lstm) o generative (qwen)
        #[arg(long, default_value = "recurrent")]
        model_type: String,
        /// Por defecto el del dataset
        #[arg(long)]
        data_type: Option<String>,
        #[arg(long)]
        epochs: Option<u32>,
        #[arg(long)]
        sequence_length: Option<usize>,
        #[arg(long)]
        learning_rate: Option<f64>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        target: Option<String>,
    },
    /// Predice el próximo valor de una secuencia
    Predict {
        #[arg(value_name = "MODEL_ID")]
        model_id: u64,
        /// Valores separados por coma
        #[arg(value_name = "VALORES", value_delimiter = ',', allow_hyphen_values = true)]
        values: Vec<f64>,
    },
    /// Compara dos modelos sobre un dataset
    Compare {
        #[arg(value_name = "MODEL_A")]
        model_a: u64,
        #[arg(value_name = "MODEL_B")]
        model_b: u64,
        #[arg(value_name = "DATASET_ID")]
        dataset_id: u64,
    },
    /// Estado de una task
    Status {
        #[arg(value_name = "TASK_ID")]
        id: u64,
    },
    /// Espera a que la task termine mostrando el progreso
    Wait {
        #[arg(value_name = "TASK_ID")]
        id: u64,
        /// Segundos entre consultas
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
    /// Resultado de una prediction o comparison terminada
    Results {
        #[arg(value_name = "TASK_ID")]
        id: u64,
    },
    Cancel {
        #[arg(value_name = "TASK_ID")]
        id: u64,
    },
    /// Lista tasks (más nuevas primero)
    Tasks {
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        page: Option<usize>,
        #[arg(long)]
        per_page: Option<usize>,
    },
    Models {
        #[arg(long)]
        active_only: bool,
    },
    /// Baja lógica de un modelo
    Deactivate {
        #[arg(value_name = "MODEL_ID")]
        id: u64,
    },
    Datasets,
    /// Registra un CSV que ya está en el disco del master
    Register {
        #[arg(value_name = "RUTA")]
        path: String,
        #[arg(value_name = "DATA_TYPE")]
        data_type: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Registra todos los CSV que matchean un patrón glob
    Scan {
        #[arg(value_name = "PATRON")]
        pattern: String,
        #[arg(value_name = "DATA_TYPE")]
        data_type: String,
    },
    /// Genera un dataset sintético
    Sample {
        #[arg(value_name = "DATA_TYPE")]
        data_type: String,
        #[arg(long)]
        rows: Option<usize>,
    },
    Stats,
}

#[derive(Debug, Deserialize)]
struct TaskAccepted {
    task_id: TaskId,
    status: TaskStatus,
}

/// Devuelve el body parseado, o el `{"error"}` del master como error.
async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    match body["error"].as_str() {
        Some(msg) => bail!("master respondió {}: {}", status, msg),
        None => bail!("master respondió {}", status),
    }
}

fn print_task(snapshot: &TaskSnapshot) {
    let t = &snapshot.task;
    println!("Task {}:", t.id);
    println!("  tipo: {}", t.kind);
    println!("  datos: {}", t.data_type);
    if let Some(mt) = t.model_type {
        println!("  modelo: {}", mt);
    }
    println!("  estado: {}", t.status);
    println!("  progreso: {:.1}%", t.progress * 100.0);
    println!("  creada: {}", t.created_at);
    if let Some(started) = t.started_at {
        println!("  iniciada: {}", started);
    }
    if let Some(done) = t.completed_at {
        println!("  finalizada: {}", done);
    }
    if let Some(m) = t.metrics() {
        println!("  métricas: mse={:.4} mae={:.4} rmse={:.4}", m.mse, m.mae, m.rmse);
    }
    if let Some(path) = &t.model_file_path {
        println!("  model_file: {}", path);
    }
    if let Some(err) = &t.error_message {
        println!("  error: {}", err);
    }
    if let Some(ResultArtifact::Prediction(p)) = &snapshot.task_results {
        println!("  predicción: {}", p.prediction);
    }
}

fn print_model(m: &Model) {
    println!(
        "Model {} ({}) tipo={} datos={} activo={} rmse={:.4} task={}",
        m.id, m.name, m.model_type, m.data_type, m.is_active, m.validation.rmse, m.training_task_id
    );
}

fn print_dataset(d: &Dataset) {
    println!(
        "Dataset {} ({}) tipo={} filas={} columnas={} path={}",
        d.id, d.name, d.data_type, d.num_samples, d.num_features, d.file_path
    );
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Train {
            dataset_id,
            model_type,
            data_type,
            epochs,
            sequence_length,
            learning_rate,
            batch_size,
            target,
        } => {
            let defaults = TrainingConfig::default();
            let config = TrainingConfig {
                sequence_length: sequence_length.unwrap_or(defaults.sequence_length),
                epochs: epochs.unwrap_or(defaults.epochs),
                learning_rate: learning_rate.unwrap_or(defaults.learning_rate),
                batch_size: batch_size.unwrap_or(defaults.batch_size),
                target_column: target,
            };
            let body = json!({
                "dataset_id": dataset_id,
                "model_type": model_type,
                "data_type": data_type,
                "config": config,
            });
            let url = format!("{}/api/v1/tasks/training", base_url);
            let accepted: TaskAccepted = read_json(client.post(&url).json(&body).send().await?).await?;
            println!("Training encolado: task {} ({})", accepted.task_id, accepted.status);
        }

        Commands::Predict { model_id, values } => {
            let url = format!("{}/api/v1/tasks/prediction", base_url);
            let body = json!({ "model_id": model_id, "input_sequence": values });
            let accepted: TaskAccepted = read_json(client.post(&url).json(&body).send().await?).await?;
            println!("Prediction encolada: task {} ({})", accepted.task_id, accepted.status);
        }

        Commands::Compare {
            model_a,
            model_b,
            dataset_id,
        } => {
            let url = format!("{}/api/v1/tasks/comparison", base_url);
            let body = json!({
                "model_a_id": model_a,
                "model_b_id": model_b,
                "dataset_id": dataset_id,
            });
            let accepted: TaskAccepted = read_json(client.post(&url).json(&body).send().await?).await?;
            println!("Comparison encolada: task {} ({})", accepted.task_id, accepted.status);
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/tasks/{id}", base_url);
            let snapshot: TaskSnapshot = read_json(client.get(&url).send().await?).await?;
            print_task(&snapshot);
        }

        Commands::Wait { id, interval } => {
            let url = format!("{}/api/v1/tasks/{id}", base_url);
            loop {
                let snapshot: TaskSnapshot = read_json(client.get(&url).send().await?).await?;
                let t = &snapshot.task;
                println!("  {} {:.1}%", t.status, t.progress * 100.0);
                if t.status.is_terminal() {
                    print_task(&snapshot);
                    break;
                }
                tokio::time::sleep(Duration::from_secs(interval.max(1))).await;
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/tasks/{id}/results", base_url);
            let artifact: ResultArtifact = read_json(client.get(&url).send().await?).await?;
            match &artifact {
                ResultArtifact::Prediction(p) => {
                    println!("Predicción de task {}: {}", p.task_id, p.prediction);
                    println!("  modelo: {} ({})", p.model_id, p.model_type);
                    println!("  duración: {} ms", p.timing.duration_ms);
                }
                ResultArtifact::Comparison(c) => {
                    println!("Comparación de task {} sobre dataset {}:", c.task_id, c.dataset_id);
                    println!("  secuencias: {} (ventana {})", c.test_sequences, c.window_length);
                    for m in [&c.model_a, &c.model_b] {
                        println!(
                            "  model {} ({}): mse={:.4} mae={:.4} rmse={:.4}",
                            m.model_id, m.model_type, m.metrics.mse, m.metrics.mae, m.metrics.rmse
                        );
                    }
                }
            }
        }

        Commands::Cancel { id } => {
            let url = format!("{}/api/v1/tasks/{id}/cancel", base_url);
            let task: common::Task = read_json(client.post(&url).send().await?).await?;
            println!("Task {} -> {}", task.id, task.status);
        }

        Commands::Tasks {
            kind,
            status,
            page,
            per_page,
        } => {
            let url = format!("{}/api/v1/tasks", base_url);
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(k) = kind {
                query.push(("kind", k));
            }
            if let Some(s) = status {
                query.push(("status", s));
            }
            if let Some(p) = page {
                query.push(("page", p.to_string()));
            }
            if let Some(pp) = per_page {
                query.push(("per_page", pp.to_string()));
            }
            let page: TaskPage = read_json(client.get(&url).query(&query).send().await?).await?;
            println!(
                "Página {}/{} ({} tasks en total)",
                page.page, page.pages, page.total
            );
            for t in page.tasks {
                println!(
                    "  {:>5} {:<10} {:<11} {:<9} {:>5.1}%",
                    t.id,
                    t.kind,
                    t.data_type,
                    t.status,
                    t.progress * 100.0
                );
            }
        }

        Commands::Models { active_only } => {
            let url = format!("{}/api/v1/models", base_url);
            let models: Vec<Model> = read_json(
                client
                    .get(&url)
                    .query(&[("active_only", active_only)])
                    .send()
                    .await?,
            )
            .await?;
            if models.is_empty() {
                println!("No hay modelos.");
            }
            models.iter().for_each(print_model);
        }

        Commands::Deactivate { id } => {
            let url = format!("{}/api/v1/models/{id}", base_url);
            let model: Model = read_json(client.delete(&url).send().await?).await?;
            print_model(&model);
        }

        Commands::Datasets => {
            let url = format!("{}/api/v1/datasets", base_url);
            let datasets: Vec<Dataset> = read_json(client.get(&url).send().await?).await?;
            if datasets.is_empty() {
                println!("No hay datasets registrados.");
            }
            datasets.iter().for_each(print_dataset);
        }

        Commands::Register {
            path,
            data_type,
            name,
        } => {
            let url = format!("{}/api/v1/datasets", base_url);
            let body = json!({ "path": path, "data_type": data_type, "name": name });
            let dataset: Dataset = read_json(client.post(&url).json(&body).send().await?).await?;
            print_dataset(&dataset);
        }

        Commands::Scan { pattern, data_type } => {
            let url = format!("{}/api/v1/datasets/scan", base_url);
            let body = json!({ "pattern": pattern, "data_type": data_type });
            let found: Vec<Dataset> = read_json(client.post(&url).json(&body).send().await?).await?;
            println!("{} datasets registrados", found.len());
            found.iter().for_each(print_dataset);
        }

        Commands::Sample { data_type, rows } => {
            let url = format!("{}/api/v1/datasets/sample", base_url);
            let body = json!({ "data_type": data_type, "rows": rows });
            let dataset: Dataset = read_json(client.post(&url).json(&body).send().await?).await?;
            print_dataset(&dataset);
        }

        Commands::Stats => {
            let url = format!("{}/api/v1/stats", base_url);
            let stats: Value = read_json(client.get(&url).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
