// gpu.rs
use gfxinfo::active_gpu;

use crate::types::GpuReport;

pub fn collect() -> Result<GpuReport, Box<dyn std::error::Error>> {
    let gpu = active_gpu()?;
    let info = gpu.info();

    Ok(GpuReport {
        name: gpu.model().to_string(),
        usage: info.load_pct() as u32,
        mem_used: info.used_vram(),
        mem_total: info.total_vram(),
    })
}

/// Model name only, for the basic-info payload. `None` when no GPU is
/// present or the probe fails.
pub fn model_name() -> Option<String> {
    active_gpu().ok().map(|gpu| gpu.model().to_string())
}
