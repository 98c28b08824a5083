//! Reporting helpers: parameter tables and reprojection exports.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use nalgebra::Vector2;

use crate::camera::CalibrationError;
use crate::optimization::CalibrationResult;
use crate::scene::Scene;

/// Ensure the output directory exists
pub fn ensure_output_dir(dir: &Path) -> Result<(), CalibrationError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            CalibrationError::IOError(format!(
                "Failed to create output directory {}: {e}",
                dir.display()
            ))
        })?;
    }
    Ok(())
}

/// Formats the initial and final value of every parameter, one row per name.
pub fn format_parameter_table(names: &[String], initial: &[f64], final_values: &[f64]) -> String {
    let mut out = format!(
        "{:<8} {:>16} {:>16} {:>14}\n",
        "name", "initial", "final", "change"
    );
    for ((name, init), fin) in names.iter().zip(initial).zip(final_values) {
        out.push_str(&format!(
            "{:<8} {:>16.6} {:>16.6} {:>14.6}\n",
            name,
            init,
            fin,
            fin - init
        ));
    }
    out
}

/// Logs the parameter table and the solver outcome of a calibration run.
pub fn display_parameters(result: &CalibrationResult) {
    info!("Calibration parameters:");
    for line in format_parameter_table(&result.names, &result.initial, &result.parameters).lines()
    {
        info!("  {line}");
    }
    info!("{}", result.summary.brief_report());
}

/// Writes projected edge points as `row,col` CSV records.
pub fn export_projected_points(path: &Path, points: &[Vector2<f64>]) -> Result<(), CalibrationError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["row", "col"])?;
    for p in points {
        writer.write_record([p.x.to_string(), p.y.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Reprojects every scene with the final parameters and writes one CSV per scene
/// into `dir`, named after the scene.
///
/// # Returns
///
/// The written file paths, in scene order.
pub fn export_reprojections(
    dir: &Path,
    result: &CalibrationResult,
    scenes: &[Scene],
) -> Result<Vec<PathBuf>, CalibrationError> {
    ensure_output_dir(dir)?;
    let model = result.model()?;
    let mut written = Vec::with_capacity(scenes.len());
    for scene in scenes {
        let points = model.project_points(&scene.edge_points);
        let path = dir.join(format!("{}_projected.csv", scene.name));
        export_projected_points(&path, &points)?;
        info!(
            "Exported {} of {} reprojected edge points for scene '{}' to {}",
            points.len(),
            scene.edge_points.len(),
            scene.name,
            path.display()
        );
        written.push(path);
    }
    Ok(written)
}
