use std::path::Path;
use anyhow::{bail, Result};
use log::debug;
use crate::config::IngestConfig;
use crate::runner::{CommandRunner, Invocation};

/// Grid edge of the area-averaged sample
const GRID: usize = 3;

/// Hex colours of consecutive RGB24 pixels; trailing partial pixels are ignored
pub fn colors_from_rgb(raw: &[u8]) -> Vec<String> {
    raw.chunks_exact(3)
        .map(|px| format!("#{:02x}{:02x}{:02x}", px[0], px[1], px[2]))
        .collect()
}

/// Sample the dominant colours of an image by area-scaling it to a 3x3 grid
pub async fn dominant_colors(runner: &dyn CommandRunner, cfg: &IngestConfig, image: &Path) -> Result<Vec<String>> {
    let inv = Invocation::new(&cfg.ffmpeg_bin)
        .args(["-hide_banner", "-nostdin", "-v", "error", "-i"])
        .path_arg(image)
        .args([
            "-vf".to_string(),
            format!("scale={}:{}:flags=area", GRID, GRID),
            "-frames:v".to_string(),
            "1".to_string(),
        ])
        .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"]);

    let output = runner.run(&inv).await?.check("colour sampling")?;
    let needed = GRID * GRID * 3;
    if output.stdout.len() < needed {
        bail!("expected {} bytes of pixels, got {}", needed, output.stdout.len());
    }

    let colors = colors_from_rgb(&output.stdout[..needed]);
    debug!("Colours of {}: {}", image.display(), colors.join(" "));
    Ok(colors)
}
