//! Octree builder binary: converts a raw volume into an octree on disk.
//!
//! Usage: cargo run --release --bin build_octree -- --input <FILE> --dim <X>x<Y>x<Z> [OPTIONS]
//!
//! Options:
//!   --input <FILE>        Raw native-endian u16 volume
//!   --dim <XxYxZ>         Volume dimensions
//!   --channels <N>        Interleaved channels (default: 1)
//!   --output <DIR>        Output directory (default: "octree")
//!   --brick <N>           Brick edge length (default: 32)
//!   --threshold <T>       Normalized homogeneity threshold, negative disables (default: 0.0)
//!   --bucket-mb <MB>      Maximum bucket file size (default: 64)
//!   --ram-mb <MB>         Cache size (default: 512)
//!   --pool-config <FILE>  JSON PoolConfig, overrides the size flags
//!   --octree-config <FILE> JSON OctreeConfig, overrides --brick/--threshold
//!
//! Output structure:
//!   <output>/
//!     octree.json           # Geometry, node count, brick pool metadata
//!     nodebuffer.raw        # Serialized nodes
//!     bricks/
//!       brickbuffer_0000000000
//!       ...

use std::path::{Path, PathBuf};
use std::time::Instant;

use glam::UVec3;

use brickpool::core::config::{OctreeConfig, PoolConfig};
use brickpool::octree::{VolumeOctree, VolumeRam};
use brickpool::pool::DiskCachedPool;
use brickpool::Result;

fn main() {
    brickpool::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let Some(input) = parse_str_arg(args, "--input") else {
        return Err(usage("--input is required"));
    };
    let Some(dim) = parse_dim_arg(args, "--dim") else {
        return Err(usage("--dim <X>x<Y>x<Z> is required"));
    };
    let channels = parse_usize_arg(args, "--channels").unwrap_or(1);
    let output_dir = PathBuf::from(parse_str_arg(args, "--output").unwrap_or_else(|| "octree".to_string()));

    let octree_config = match parse_str_arg(args, "--octree-config") {
        Some(path) => OctreeConfig::load(Path::new(&path))?,
        None => OctreeConfig {
            brick_dim: parse_u32_arg(args, "--brick").unwrap_or(32),
            homogeneity_threshold: parse_f32_arg(args, "--threshold").unwrap_or(0.0),
        },
    };
    let mut pool_config = match parse_str_arg(args, "--pool-config") {
        Some(path) => PoolConfig::load(Path::new(&path))?,
        None => PoolConfig {
            max_bucket_size_bytes: parse_u64_arg(args, "--bucket-mb").unwrap_or(64) << 20,
            max_ram_bytes: parse_u64_arg(args, "--ram-mb").unwrap_or(512) << 20,
            ..PoolConfig::default()
        },
    };
    pool_config.pool_path = output_dir.join("bricks");

    println!("=== Brickpool Octree Builder ===");
    println!("Input:     {}", input);
    println!("Volume:    {} x {} channel(s)", dim, channels);
    println!("Brick:     {}", octree_config.brick_dim);
    println!("Threshold: {}", octree_config.homogeneity_threshold);
    println!("Output:    {}", output_dir.display());
    println!();

    let start = Instant::now();
    let volume = VolumeRam::load_raw(Path::new(&input), dim, channels)?;
    println!("Loaded {} voxels in {:.2?}", volume.num_voxels(), start.elapsed());

    let pool = DiskCachedPool::new(pool_config);
    let mut octree = VolumeOctree::build(&volume, &octree_config, Box::new(pool))?;
    let manifest = octree.save(&output_dir)?;

    println!();
    println!("{}", octree.description());
    println!("{:#?}", octree.pool().stats());
    println!(
        "Wrote {} nodes ({} bytes) in {:.2?}",
        manifest.node_count,
        manifest.node_buffer_size,
        start.elapsed()
    );
    Ok(())
}

fn usage(message: &str) -> brickpool::Error {
    brickpool::Error::InvalidArgument(format!(
        "{}\nusage: build_octree --input <FILE> --dim <X>x<Y>x<Z> [--channels N] [--output DIR]",
        message
    ))
}

fn parse_f32_arg(args: &[String], flag: &str) -> Option<f32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u32_arg(args: &[String], flag: &str) -> Option<u32> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_u64_arg(args: &[String], flag: &str) -> Option<u64> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_usize_arg(args: &[String], flag: &str) -> Option<usize> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
}

fn parse_str_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// `64x64x32`
fn parse_dim_arg(args: &[String], flag: &str) -> Option<UVec3> {
    let text = parse_str_arg(args, flag)?;
    let parts: Vec<u32> = text.split('x').map(|s| s.parse().ok()).collect::<Option<_>>()?;
    match parts[..] {
        [x, y, z] => Some(UVec3::new(x, y, z)),
        _ => None,
    }
}
