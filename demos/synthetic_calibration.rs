//! Synthetic LiDAR-fisheye calibration
//!
//! This demo renders camera edge-density fields from LiDAR edges projected with a
//! known ground-truth calibration, perturbs the parameters and recovers them with
//! the joint multi-scene solver.
//!
//! Each scene consists of a handful of 3D line segments (door frames, poles and
//! table edges at various depths). The edge-density field of a scene is the
//! Gaussian kernel density of the ground-truth projections of those segments.
//!
//! Usage:
//! ```bash
//! cargo run --example synthetic_calibration -- --scenes 3 --backend trust-region
//! ```

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use lidar_fisheye_calib::config::default_parameter_names;
use lidar_fisheye_calib::util::{display_parameters, export_reprojections};
use lidar_fisheye_calib::{
    calibrate, CalibrationConfig, DensityField, FisheyePolyModel, ImageSize, ParameterSet,
    PolynomialLayout, Scene, SolverBackend,
};
use log::info;
use nalgebra::{Matrix2, Vector3};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    TrustRegion,
    TinySolver,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of synthetic scenes
    #[arg(short = 's', long, default_value = "3")]
    scenes: usize,

    /// Samples per line segment
    #[arg(short = 'n', long, default_value = "60")]
    samples: usize,

    /// Kernel bandwidth of the rendered density fields, in pixels
    #[arg(short = 'b', long, default_value = "3.0")]
    bandwidth: f64,

    /// Solver backend
    #[arg(long, value_enum, default_value = "trust-region")]
    backend: Backend,

    /// Worker threads for residual evaluation
    #[arg(short = 't', long, default_value = "4")]
    threads: usize,

    /// Directory for the config, result and reprojection exports
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Log every solver iteration
    #[arg(short = 'v', long)]
    verbose: bool,
}

const IMAGE_SIZE: u32 = 240;

fn ground_truth() -> Vec<f64> {
    vec![
        0.02, -0.015, 0.03, // rotation
        0.05, -0.03, 0.08, // translation
        120.0, 118.0, // principal point
        0.0, 70.0, -4.0, 0.3, // a0, a1, a3, a5
    ]
}

/// Line segments of scene `k`, shifted and rotated a little per scene.
fn scene_segments(k: usize) -> Vec<(Vector3<f64>, Vector3<f64>)> {
    let shift = 0.3 * k as f64;
    let depth = 2.0 + 0.5 * k as f64;
    vec![
        // door frame
        (
            Vector3::new(-0.8 + shift, -1.0, depth),
            Vector3::new(-0.8 + shift, 1.0, depth),
        ),
        (
            Vector3::new(0.2 + shift, -1.0, depth),
            Vector3::new(0.2 + shift, 1.0, depth),
        ),
        (
            Vector3::new(-0.8 + shift, -1.0, depth),
            Vector3::new(0.2 + shift, -1.0, depth),
        ),
        // pole closer to the sensor
        (
            Vector3::new(1.1 - shift, -1.5, 1.5),
            Vector3::new(1.1 - shift, 1.5, 1.5),
        ),
        // table edge running away from the sensor
        (
            Vector3::new(-1.5, 0.6 - 0.1 * k as f64, 1.0),
            Vector3::new(-0.5, 0.6 - 0.1 * k as f64, 4.0),
        ),
    ]
}

fn sample_segments(segments: &[(Vector3<f64>, Vector3<f64>)], samples: usize) -> Vec<Vector3<f64>> {
    segments
        .iter()
        .flat_map(|(a, b)| {
            (0..samples).map(move |i| {
                let t = i as f64 / (samples.max(2) - 1) as f64;
                a + (b - a) * t
            })
        })
        .collect()
}

/// Gaussian kernel density of the projected points on the image grid.
fn render_density(
    model: &FisheyePolyModel,
    points: &[Vector3<f64>],
    bandwidth: f64,
) -> Result<DensityField, Box<dyn std::error::Error>> {
    let pixels = model.project_points(points);
    let size = IMAGE_SIZE as usize;
    let inv_two_var = 1.0 / (2.0 * bandwidth * bandwidth);
    let reach = (4.0 * bandwidth).ceil() as isize;
    let mut data = vec![0.0; size * size];
    for p in &pixels {
        let (pr, pc) = (p.x.round() as isize, p.y.round() as isize);
        for r in (pr - reach).max(0)..(pr + reach + 1).min(size as isize) {
            for c in (pc - reach).max(0)..(pc + reach + 1).min(size as isize) {
                let dr = r as f64 - p.x;
                let dc = c as f64 - p.y;
                data[r as usize * size + c as usize] += (-(dr * dr + dc * dc) * inv_two_var).exp();
            }
        }
    }
    Ok(DensityField::new(size, size, data, bandwidth)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let layout = PolynomialLayout::Sparse;
    let truth = ground_truth();
    let truth_model = FisheyePolyModel::new(layout, &truth, &Matrix2::identity())?;

    let scenes = (0..cli.scenes)
        .map(|k| {
            let points = sample_segments(&scene_segments(k), cli.samples);
            let density = render_density(&truth_model, &points, cli.bandwidth)?;
            info!("Scene {k}: {} edge points", points.len());
            Ok(Scene::new(
                format!("scene_{k}"),
                points,
                density,
                ImageSize::new(IMAGE_SIZE, IMAGE_SIZE),
            ))
        })
        .collect::<Result<Vec<_>, Box<dyn std::error::Error>>>()?;

    let mut initial = truth.clone();
    let perturbation = [0.01, -0.01, 0.01, 0.02, 0.02, -0.02, 3.0, -3.0, 0.0, 2.0, 0.0, 0.0];
    for (value, delta) in initial.iter_mut().zip(perturbation) {
        *value += delta;
    }
    let lower = vec![
        -0.1, -0.1, -0.1, -0.2, -0.2, -0.2, 100.0, 100.0, 0.0, 60.0, -8.0, 0.3,
    ];
    let upper = vec![
        0.1, 0.1, 0.1, 0.2, 0.2, 0.2, 140.0, 140.0, 0.0, 80.0, 0.0, 0.3,
    ];

    let mut config = CalibrationConfig::new(
        layout,
        ParameterSet {
            names: default_parameter_names(layout),
            initial,
            lower,
            upper,
        },
    );
    config.solver.backend = match cli.backend {
        Backend::TrustRegion => SolverBackend::TrustRegion,
        Backend::TinySolver => SolverBackend::TinySolver,
    };
    config.solver.num_threads = cli.threads;
    config.solver.verbose = cli.verbose;

    let result = calibrate(&config, &scenes)?;
    display_parameters(&result);
    info!("\n{}", result.summary.full_report());

    for ((name, estimated), expected) in result.named_parameters().into_iter().zip(&truth) {
        info!("{name:<4} truth {expected:>10.4}  estimated {estimated:>10.4}");
    }

    if let Some(dir) = cli.output {
        lidar_fisheye_calib::util::ensure_output_dir(&dir)?;
        let config_path = dir.join("config.yaml");
        let result_path = dir.join("result.json");
        config.save_to_yaml(&config_path.to_string_lossy())?;
        result.save_to_json(&result_path.to_string_lossy())?;
        let written = export_reprojections(&dir, &result, &scenes)?;
        info!(
            "Wrote {}, {} and {} reprojection files",
            config_path.display(),
            result_path.display(),
            written.len()
        );
    }

    Ok(())
}
