use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image_customizer::config::load_config;
use image_customizer::pipeline::packages::{ChrootPackageManager, DEFAULT_PACKAGE_MANAGER};
use image_customizer::preflight::{check_host_tools, check_image_tools};
use image_customizer::{customize, ImageChroot};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "IMAGE_CUSTOMIZER_LOG";

fn usage() -> &'static str {
    "Usage:\n  image-customizer customize <config.toml> <image_root> [--build-dir <dir>] [--package-source <dir>]... [--no-base-repos] [--package-manager <program>]\n  image-customizer check <config.toml> <image_root>\n\nLog level is read from IMAGE_CUSTOMIZER_LOG (default: info)."
}

struct CustomizeOptions {
    build_dir: PathBuf,
    package_sources: Vec<PathBuf>,
    use_base_image_repos: bool,
    package_manager: String,
}

impl Default for CustomizeOptions {
    fn default() -> Self {
        Self {
            build_dir: std::env::temp_dir().join("image-customizer"),
            package_sources: Vec::new(),
            use_base_image_repos: true,
            package_manager: DEFAULT_PACKAGE_MANAGER.to_string(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config, root, rest @ ..] if cmd == "customize" => {
            let options = parse_customize_options(rest)?;
            run_customize(Path::new(config), Path::new(root), options)
        }
        [cmd, config, root] if cmd == "check" => run_check(Path::new(config), Path::new(root)),
        _ => bail!(usage()),
    }
}

fn parse_customize_options(args: &[String]) -> Result<CustomizeOptions> {
    let mut options = CustomizeOptions::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--build-dir" => {
                options.build_dir = PathBuf::from(flag_value(&mut iter, arg)?);
            }
            "--package-source" => {
                options
                    .package_sources
                    .push(PathBuf::from(flag_value(&mut iter, arg)?));
            }
            "--no-base-repos" => options.use_base_image_repos = false,
            "--package-manager" => {
                options.package_manager = flag_value(&mut iter, arg)?.to_string();
            }
            other => bail!("unsupported argument '{}'\n\n{}", other, usage()),
        }
    }

    Ok(options)
}

fn flag_value<'a>(iter: &mut impl Iterator<Item = &'a String>, flag: &str) -> Result<&'a str> {
    match iter.next() {
        Some(value) => Ok(value.as_str()),
        None => bail!("missing value for '{}'", flag),
    }
}

fn run_check(config_path: &Path, root: &Path) -> Result<()> {
    let loaded = load_config(config_path)?;
    check_host_tools()?;
    check_image_tools(root, &loaded.config)?;
    println!(
        "[check] '{}' can be applied to '{}'",
        config_path.display(),
        root.display()
    );
    Ok(())
}

fn run_customize(config_path: &Path, root: &Path, options: CustomizeOptions) -> Result<()> {
    let loaded = load_config(config_path)?;
    check_host_tools()?;
    check_image_tools(root, &loaded.config)?;

    std::fs::create_dir_all(&options.build_dir).with_context(|| {
        format!(
            "creating build directory '{}'",
            options.build_dir.display()
        )
    })?;

    let mut chroot = ImageChroot::open(root)?;
    let mut packages = ChrootPackageManager::new(&options.package_manager);

    info!(
        config = %config_path.display(),
        root = %root.display(),
        "customizing image"
    );

    customize(
        &options.build_dir,
        &loaded.base_dir,
        &loaded.config,
        &mut chroot,
        &mut packages,
        &options.package_sources,
        options.use_base_image_repos,
    )
    .with_context(|| format!("customizing image '{}'", root.display()))?;

    println!("[customize] '{}' customized", root.display());
    Ok(())
}
