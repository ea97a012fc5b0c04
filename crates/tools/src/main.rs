use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use foundation::GeoBoundingBox;
use layers::LoadError;
use layers::load::prepare_volume;
use runtime::QualityTier;
use serde_json::json;
use streaming::{
    CameraPose, CancelToken, HttpBackend, VolumeBackend, VolumeQuery, estimate_window,
    window_radius_m,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect VolumePack files and exercise a volume backend")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode a pack and print its header, value range, atlas and ray-march parameters
    Inspect {
        path: PathBuf,

        /// Bounds used when the header carries none: west,south,east,north,bottom,top
        #[arg(long)]
        bbox: Option<String>,

        #[arg(long, default_value_t = 1.0)]
        step_voxels: f64,

        #[arg(long, default_value = "medium")]
        quality: QualityTier,
    },

    /// Print the request window and cache key a camera would produce
    Window {
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,

        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        /// Camera height above the ellipsoid (m)
        #[arg(long)]
        height: f64,

        #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
        heading_deg: f64,

        /// Negative looks down; omitted means a nadir view
        #[arg(long, allow_hyphen_values = true)]
        pitch_deg: Option<f64>,

        #[arg(long)]
        fov_deg: Option<f64>,

        #[arg(long)]
        aspect: Option<f64>,

        #[arg(long, default_value = "1000,850,700,500,300")]
        levels: String,

        #[arg(long, default_value = "medium")]
        quality: QualityTier,

        #[arg(long)]
        valid_time: Option<String>,
    },

    /// Fetch one window from a backend and verify it decodes
    Fetch {
        #[arg(long)]
        endpoint: String,

        /// west,south,east,north,bottom,top
        #[arg(long, allow_hyphen_values = true)]
        bbox: String,

        #[arg(long, default_value = "1000,850,700,500,300")]
        levels: String,

        /// Horizontal grid spacing (m)
        #[arg(long, default_value_t = 3_000.0)]
        res: f64,

        #[arg(long)]
        valid_time: Option<String>,

        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,

        /// Write the raw pack here
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let report = match args.command {
        Command::Inspect {
            path,
            bbox,
            step_voxels,
            quality,
        } => {
            let bytes = tokio::fs::read(&path).await?;
            let hint = bbox.as_deref().map(parse_bbox).transpose()?;
            inspect(&bytes, hint, step_voxels, quality)?
        }
        Command::Window {
            lon,
            lat,
            height,
            heading_deg,
            pitch_deg,
            fov_deg,
            aspect,
            levels,
            quality,
            valid_time,
        } => {
            let mut pose = CameraPose::new(lon, lat, height);
            if let Some(pitch) = pitch_deg {
                pose = pose.with_heading_pitch(heading_deg, pitch);
            }
            if let (Some(fov), Some(aspect)) = (fov_deg, aspect) {
                pose = pose.with_frustum(fov.to_radians(), aspect);
            }
            let bbox = estimate_window(&pose);
            let query = VolumeQuery::new(
                bbox,
                &parse_levels(&levels)?,
                quality.preset().grid_resolution_m,
                valid_time.as_deref(),
            )?;
            json!({
                "radius_m": window_radius_m(&pose),
                "bbox": bbox,
                "levels": query.levels,
                "resolution_m": query.resolution_m,
                "cache_key": query.cache_key().to_string(),
            })
        }
        Command::Fetch {
            endpoint,
            bbox,
            levels,
            res,
            valid_time,
            timeout_ms,
            out,
        } => {
            let query = VolumeQuery::new(
                parse_bbox(&bbox)?,
                &parse_levels(&levels)?,
                res,
                valid_time.as_deref(),
            )?;
            let backend = HttpBackend::new(endpoint, Duration::from_millis(timeout_ms));
            info!(key = %query.cache_key(), "fetching volume");
            let body = backend.fetch(&query).await?;

            if let Some(out) = &out {
                tokio::fs::write(out, &body).await?;
                info!(path = %out.display(), bytes = body.len(), "wrote pack");
            }
            inspect(&body, Some(query.bbox), 1.0, QualityTier::Medium)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn inspect(
    bytes: &[u8],
    bbox_hint: Option<GeoBoundingBox>,
    step_voxels: f64,
    quality: QualityTier,
) -> Result<serde_json::Value, LoadError> {
    let prepared = prepare_volume(bytes, bbox_hint, step_voxels, &CancelToken::new())?;
    let uniforms = &prepared.uniforms;
    Ok(json!({
        "metadata": prepared.metadata,
        "metrics": prepared.metrics,
        "atlas": {
            "grid": [prepared.atlas.layout.grid_cols, prepared.atlas.layout.grid_rows],
            "slice": [prepared.atlas.layout.slice_width, prepared.atlas.layout.slice_height],
        },
        "ray_march": {
            "dimensions_m": uniforms.dimensions_m,
            "voxel_size_m": uniforms.voxel_size_m,
            "step_m": uniforms.step_m,
            "max_steps": uniforms.recommended_max_steps(quality.preset().ray_march_steps),
        },
    }))
}

fn parse_bbox(text: &str) -> Result<GeoBoundingBox, String> {
    let parts = parse_numbers(text)?;
    let &[west, south, east, north, bottom, top] = parts.as_slice() else {
        return Err(format!(
            "bbox needs 6 values (west,south,east,north,bottom,top), got {}",
            parts.len()
        ));
    };
    GeoBoundingBox::new(west, south, east, north, bottom, top).map_err(|e| e.to_string())
}

fn parse_levels(text: &str) -> Result<Vec<f64>, String> {
    parse_numbers(text)
}

fn parse_numbers(text: &str) -> Result<Vec<f64>, String> {
    text.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<f64>()
                .map_err(|_| format!("not a number: {s:?}"))
        })
        .collect()
}
