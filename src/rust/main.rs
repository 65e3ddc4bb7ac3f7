use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use log::{debug, info};
use ndarray::Array1;
use visprompt::{
    auto_label_shared, BBox, CacheSession, Detection, Detector, DetectorError, EmbeddingTable, ExtractionError,
    FeatureExtractor, ImageRef, PromptEntry, Region, SessionConfig, SessionEvent, SessionHandle,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Session config file (JSON); defaults to $VISPROMPT_CONFIG or the user config dir
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the prompt cache capacity
    #[arg(long)]
    capacity: Option<usize>,

    /// Number of auto-labeling rounds to run
    #[arg(short, long, default_value_t = 20)]
    rounds: usize,

    /// Make every Nth extraction call fail
    #[arg(long)]
    fail_every: Option<usize>,
}

const DIM: usize = 8;

/// Deterministic extractor: the vector depends only on the box geometry
struct SyntheticExtractor {
    calls: AtomicUsize,
    fail_every: Option<usize>,
}

impl FeatureExtractor for SyntheticExtractor {
    fn extract_batch(&self, image: &ImageRef, boxes: &[BBox]) -> Result<Vec<Array1<f32>>, ExtractionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every.is_some_and(|n| n > 0 && call % n == 0) {
            return Err(ExtractionError::Backend(format!("synthetic outage on call {} ({})", call, image)));
        }
        Ok(boxes
            .iter()
            .map(|b| Array1::from_shape_fn(DIM, |i| ((b.x1 + b.width() * i as f32) * 0.01).sin() + 1.1))
            .collect())
    }
}

/// Reports one box per non-zero table row, with a score that cycles per image
struct SyntheticDetector;

impl Detector for SyntheticDetector {
    fn infer(&self, image: &ImageRef, table: &EmbeddingTable) -> Result<Vec<Detection>, DetectorError> {
        let seed = image.as_str().bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        Ok((0..table.rows())
            .filter(|&row| table.row(row).is_some_and(|v| v.iter().any(|x| *x != 0.0)))
            .map(|row| {
                let score = 0.35 + ((seed as usize + row * 7) % 60) as f32 / 100.0;
                let x = 20.0 * row as f32 + (seed % 10) as f32;
                Detection::new(BBox::new(x, 10.0, x + 40.0, 60.0), row, score)
            })
            .collect())
    }
}

fn load_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::from_json_file(path).with_context(|| format!("reading {:?}", path))?,
        None => SessionConfig::load_default()?,
    };
    if let Some(capacity) = args.capacity {
        config = config.with_capacity(capacity);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("=== Starting Visual Prompt Demo ===");
    let config = load_config(&args)?;
    let session = CacheSession::new(config)?.with_class_names(vec!["person".into(), "bicycle".into(), "car".into()]);
    let extractor = Arc::new(SyntheticExtractor {
        calls: AtomicUsize::new(0),
        fail_every: args.fail_every,
    });
    let handle = SessionHandle::new(session, extractor);

    let mut events = handle.subscribe().await;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::EntryExtracted { .. } | SessionEvent::StateChanged { .. } => debug!("{:?}", event),
                other => info!("Event: {:?}", other),
            }
        }
    });

    let start_time = Instant::now();
    let seed = PromptEntry::seed(
        "frame_000.jpg",
        vec![
            Region::new(BBox::new(12.0, 30.0, 80.0, 200.0), 0),
            Region::new(BBox::new(150.0, 90.0, 260.0, 170.0), 2),
        ],
    );
    let report = handle.add_seed(seed).await?;
    println!("Seeded generation {} ({:?})", report.generation, report.status);

    for round in 1..=args.rounds {
        let image = ImageRef::new(format!("frame_{:03}.jpg", round));
        let outcome = auto_label_shared(&handle, &image, &SyntheticDetector).await?;

        println!("\n{} (generation {}):", image, outcome.generation);
        for label in &outcome.labels {
            let [x, y, w, h] = label.bbox.to_xywh();
            println!(
                "  {:<10} {:.2}  [{:.0}, {:.0}, {:.0}, {:.0}]",
                label.class_name.to_string(),
                label.score,
                x,
                y,
                w,
                h
            );
        }
        if let Some(promotion) = &outcome.promotion {
            if promotion.status.is_degraded() {
                println!("  auto-labeling temporarily degraded, using previous prompts");
            }
            debug!("Promotion: {:?}", promotion.admission);
        }
    }

    let info = handle.info().await;
    println!("\n=== Demo Complete (took {:.2?}) ===", start_time.elapsed());
    println!("Generation: {}", info.generation);
    println!("Classes: {:?}", info.class_names);
    println!(
        "Prompts: {} seeds, {} volatile (capacity {})",
        info.seeds, info.volatile, info.capacity
    );
    println!("Embedding dim: {:?}", info.embedding_dim);
    Ok(())
}
