use anyhow::{Context, Result};
use colored::Colorize;
use std::process::Command;
use std::time::Instant;

/// Feature combinations the overlay crate must build under. The core is
/// `no_std`, so each one is checked without default features.
const BUILDS: &[(&str, &[&str])] = &[
    (
        "platform HAL (no_std)",
        &["check", "-p", "platform", "--no-default-features"],
    ),
    (
        "overlay (no_std, 32-bit sizes)",
        &["check", "-p", "overlay", "--no-default-features"],
    ),
    (
        "overlay (16-bit sizes)",
        &["check", "-p", "overlay", "--no-default-features", "--features", "ovl-size-16"],
    ),
    (
        "overlay (defmt logging)",
        &["check", "-p", "overlay", "--no-default-features", "--features", "defmt"],
    ),
    (
        "overlay (tracing logging, std)",
        &["check", "-p", "overlay", "--features", "tracing,std"],
    ),
];

pub fn run() -> Result<()> {
    println!();
    println!("{}", "🔍 Checking overlay builds...".cyan().bold());
    println!();

    let total_start = Instant::now();

    for (label, args) in BUILDS {
        println!("{}", format!("  Checking {label}...").cyan());
        let start = Instant::now();

        let output = Command::new("cargo")
            .args(*args)
            .output()
            .with_context(|| format!("Failed to check {label}"))?;

        if !output.status.success() {
            eprintln!("{}", format!("  ✗ {label} check failed").red().bold());
            eprintln!();
            eprintln!("{}", String::from_utf8_lossy(&output.stderr));
            anyhow::bail!("{label} check failed");
        }

        println!(
            "{}",
            format!(
                "  ✓ {label} passed in {:.2}s",
                start.elapsed().as_secs_f64()
            )
            .green()
        );
        println!();
    }

    // Clippy: the lint policy denies unchecked arithmetic and indexing.
    println!("{}", "  Running clippy lints...".cyan());
    let clippy_start = Instant::now();

    let clippy_output = Command::new("cargo")
        .args(["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])
        .output()
        .context("Failed to run clippy")?;

    if !clippy_output.status.success() {
        eprintln!("{}", "  ⚠ Clippy warnings found".yellow().bold());
        eprintln!();
        eprintln!("{}", String::from_utf8_lossy(&clippy_output.stderr));
        // Reported, not fatal
    } else {
        println!(
            "{}",
            format!(
                "  ✓ Clippy passed in {:.2}s",
                clippy_start.elapsed().as_secs_f64()
            )
            .green()
        );
    }
    println!();

    println!("{}", "  Checking code formatting...".cyan());

    let fmt_output = Command::new("cargo")
        .args(["fmt", "--all", "--check"])
        .output()
        .context("Failed to run cargo fmt")?;

    if !fmt_output.status.success() {
        eprintln!("{}", "  ⚠ Formatting issues found".yellow().bold());
        eprintln!("     Run 'cargo fmt --all' to fix");
    } else {
        println!("{}", "  ✓ Formatting check passed".green());
    }
    println!();

    println!(
        "{}",
        format!(
            "✓ All checks completed in {:.2}s",
            total_start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    println!();

    Ok(())
}
