use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sentinel_core::{
    DetectedFace, Embedding, EnrolledIdentity, EnrollmentStore, OnnxRecognizer, RecognitionEngine,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "sentinel", about = "Sentinel access control: enrollment and status")]
struct Cli {
    /// Enrollment file (default: $SENTINEL_ENROLLMENT_PATH or the daemon's default)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Talk to the daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face from an image (adds a reference if the identity exists)
    Enroll {
        /// Identity id (e.g. "alice")
        #[arg(long)]
        id: String,
        /// Display name for a new identity
        #[arg(long)]
        name: Option<String>,
        /// Image containing the face; the largest face is used
        #[arg(long)]
        image: PathBuf,
        /// Model directory (default: $SENTINEL_MODEL_DIR or the daemon's default)
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Add a precomputed reference embedding from a JSON file
    AddEmbedding {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// JSON array of floats, or an object with a "values" array
        #[arg(long)]
        file: PathBuf,
    },
    /// List enrolled identities
    List,
    /// Remove an identity, or one of its reference embeddings
    Remove {
        id: String,
        /// Index of the reference embedding to remove (see `list`)
        #[arg(long)]
        reference: Option<usize>,
    },
    /// Show daemon status
    Status,
    /// Ask the daemon to reload the enrollment file
    Reload,
}

#[zbus::proxy(
    interface = "org.sentinel.Sentinel1",
    default_service = "org.sentinel.Sentinel1",
    default_path = "/org/sentinel/Sentinel1"
)]
trait Sentinel {
    async fn status(&self) -> zbus::Result<String>;
    async fn reload(&self) -> zbus::Result<u32>;
}

/// Accepted layouts of an embedding file.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbeddingFile {
    Bare(Vec<f32>),
    Full(Embedding),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store_path = cli
        .store
        .clone()
        .or_else(|| std::env::var_os("SENTINEL_ENROLLMENT_PATH").map(PathBuf::from))
        .unwrap_or_else(sentinel_core::default_enrollment_path);

    match cli.command {
        Commands::Enroll {
            id,
            name,
            image,
            model_dir,
        } => {
            let model_dir = model_dir
                .or_else(|| std::env::var_os("SENTINEL_MODEL_DIR").map(PathBuf::from))
                .unwrap_or_else(sentinel_core::default_model_dir);
            let embedding = embed_image(&image, &model_dir)?;
            let store = open_store(&store_path)?;
            let refs = add_reference(&store, &id, name, embedding)?;
            println!("Enrolled {id} from {} ({refs} reference(s))", image.display());
            print_reload_hint();
        }
        Commands::AddEmbedding { id, name, file } => {
            let embedding = read_embedding_file(&file)?;
            let store = open_store(&store_path)?;
            let refs = add_reference(&store, &id, name, embedding)?;
            println!("Added embedding to {id} ({refs} reference(s))");
            print_reload_hint();
        }
        Commands::List => {
            let store = open_store(&store_path)?;
            let gallery = store.snapshot();
            if gallery.is_empty() {
                println!("No identities enrolled");
            }
            for identity in gallery.identities() {
                println!(
                    "{}\t{}\t{} reference(s), dim {}",
                    identity.identity_id,
                    identity.display_name,
                    identity.reference_embeddings.len(),
                    identity.reference_embeddings.first().map_or(0, Embedding::dim),
                );
            }
        }
        Commands::Remove { id, reference } => {
            let store = open_store(&store_path)?;
            match reference {
                Some(index) => {
                    store.remove_reference(&id, index)?;
                    println!("Removed reference {index} from {id}");
                }
                None => {
                    if !store.remove_identity(&id)? {
                        bail!("no identity {id:?} enrolled");
                    }
                    println!("Removed {id}");
                }
            }
            store.save()?;
            print_reload_hint();
        }
        Commands::Status => {
            let proxy = connect(cli.session_bus).await?;
            let raw = proxy.status().await.context("Status call failed")?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Reload => {
            let proxy = connect(cli.session_bus).await?;
            let count = proxy.reload().await.context("Reload call failed")?;
            println!("sentineld reloaded {count} identities");
        }
    }

    Ok(())
}

async fn connect(session_bus: bool) -> Result<SentinelProxy<'static>> {
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    SentinelProxy::new(&conn)
        .await
        .context("sentineld not reachable over D-Bus")
}

fn open_store(path: &Path) -> Result<EnrollmentStore> {
    EnrollmentStore::open(path.to_path_buf())
        .with_context(|| format!("opening enrollment store {}", path.display()))
}

/// Append `embedding` to `id`, creating the identity if needed, and persist.
/// Returns the identity's reference count afterwards.
fn add_reference(
    store: &EnrollmentStore,
    id: &str,
    name: Option<String>,
    embedding: Embedding,
) -> Result<usize> {
    if store.snapshot().get(id).is_some() {
        store.add_reference(id, embedding)?;
    } else {
        store.upsert_identity(EnrolledIdentity {
            identity_id: id.to_string(),
            display_name: name.unwrap_or_else(|| id.to_string()),
            reference_embeddings: vec![embedding],
        })?;
    }
    store.save()?;
    Ok(store
        .snapshot()
        .get(id)
        .map_or(0, |i| i.reference_embeddings.len()))
}

fn embed_image(image: &Path, model_dir: &Path) -> Result<Embedding> {
    let gray = image::open(image)
        .with_context(|| format!("reading {}", image.display()))?
        .to_luma8();
    let (width, height) = gray.dimensions();

    let mut recognizer = OnnxRecognizer::load(model_dir, 0.5)
        .with_context(|| format!("loading models from {}", model_dir.display()))?;
    let faces = recognizer.detect_and_embed(gray.as_raw(), width, height)?;
    tracing::debug!(faces = faces.len(), "faces found in enrollment image");

    match largest_face(faces) {
        Some(face) => Ok(face.embedding),
        None => bail!("no face found in {}", image.display()),
    }
}

fn largest_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces
        .into_iter()
        .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
}

fn read_embedding_file(path: &Path) -> Result<Embedding> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_embedding(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_embedding(text: &str) -> Result<Embedding> {
    let embedding = match serde_json::from_str(text)? {
        EmbeddingFile::Bare(values) => Embedding::new(values),
        EmbeddingFile::Full(embedding) => embedding,
    };
    if embedding.values.is_empty() {
        bail!("embedding is empty");
    }
    if embedding.values.iter().any(|v| !v.is_finite()) {
        bail!("embedding contains non-finite values");
    }
    Ok(embedding)
}

fn print_reload_hint() {
    println!("Run `sentinel reload` if sentineld does not poll the enrollment file.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::BoundingBox;

    fn face(side: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox { x: 0.0, y: 0.0, width: side, height: side, confidence: 0.9 },
            embedding: Embedding::new(vec![side, 0.0]),
            detection_confidence: 0.9,
        }
    }

    #[test]
    fn test_largest_face_wins() {
        let picked = largest_face(vec![face(20.0), face(80.0), face(40.0)]).unwrap();
        assert_eq!(picked.embedding.values[0], 80.0);
        assert!(largest_face(Vec::new()).is_none());
    }

    #[test]
    fn test_parse_embedding_layouts() {
        assert_eq!(parse_embedding("[0.5, 0.25]").unwrap().values, vec![0.5, 0.25]);
        let full = parse_embedding(r#"{"values": [1.0], "model_version": "v2"}"#).unwrap();
        assert_eq!(full.model_version.as_deref(), Some("v2"));
        assert!(parse_embedding("[]").is_err());
        assert!(parse_embedding("\"nope\"").is_err());
    }

    #[test]
    fn test_add_reference_creates_then_appends() {
        let path = std::env::temp_dir()
            .join(format!("sentinel-cli-{}", uuid::Uuid::new_v4()))
            .join("enrollment.json");
        let store = EnrollmentStore::open(path.clone()).unwrap();

        assert_eq!(add_reference(&store, "bob", None, Embedding::new(vec![1.0, 0.0])).unwrap(), 1);
        assert_eq!(add_reference(&store, "bob", Some("ignored".into()), Embedding::new(vec![0.0, 1.0])).unwrap(), 2);

        let reopened = EnrollmentStore::open(path.clone()).unwrap();
        let bob = reopened.snapshot().get("bob").cloned().unwrap();
        assert_eq!(bob.display_name, "bob");
        assert_eq!(bob.reference_embeddings.len(), 2);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
