use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

/// One rendered documentation set. `OvlSize` and every size-carrying field
/// change width with `ovl-size-16`, so each size configuration gets its own
/// target directory.
struct DocSet {
    label: &'static str,
    features: &'static str,
    target_dir: Option<&'static str>,
}

const SETS: &[DocSet] = &[
    DocSet {
        label: "32-bit overlay sizes",
        features: "platform/simulator,overlay/std",
        target_dir: None,
    },
    DocSet {
        label: "16-bit overlay sizes",
        features: "platform/simulator,overlay/std,overlay/ovl-size-16",
        target_dir: Some("target/doc-ovl-size-16"),
    },
];

impl DocSet {
    fn index(&self) -> PathBuf {
        let root = PathBuf::from(self.target_dir.unwrap_or("target"));
        root.join("doc").join("overlay").join("index.html")
    }
}

pub fn run(open: bool) -> Result<()> {
    println!();
    println!("{}", "📚 Building overlay documentation...".cyan().bold());
    println!();

    let total_start = Instant::now();

    for (i, set) in SETS.iter().enumerate() {
        println!("{}", format!("  Documenting {}...", set.label).cyan());
        let start = Instant::now();

        let mut cmd = Command::new("cargo");
        cmd.args(["doc", "-p", "overlay", "-p", "platform", "--no-deps"])
            .args(["--features", set.features])
            .arg("--document-private-items");
        if let Some(dir) = set.target_dir {
            cmd.args(["--target-dir", dir]);
        }
        // Only the primary set is opened; two browser tabs of the same crate
        // differ in nothing but size types.
        if open && i == 0 {
            cmd.arg("--open");
        }

        let output = cmd
            .output()
            .with_context(|| format!("Failed to document {}", set.label))?;

        if !output.status.success() {
            eprintln!("{}", format!("  ✗ {} docs failed", set.label).red().bold());
            eprintln!();
            eprintln!("{}", String::from_utf8_lossy(&output.stderr));
            anyhow::bail!("{} documentation build failed", set.label);
        }

        println!(
            "{}",
            format!(
                "  ✓ {} in {:.2}s → {}",
                set.label,
                start.elapsed().as_secs_f64(),
                set.index().display()
            )
            .green()
        );
    }

    println!();
    println!(
        "{}",
        format!(
            "✓ Documentation built in {:.2}s",
            total_start.elapsed().as_secs_f64()
        )
        .green()
        .bold()
    );
    if !open {
        println!(
            "   {}",
            "Run 'cargo run -p xtask -- doc --open' to browse the 32-bit set".dimmed()
        );
    }
    println!();

    Ok(())
}
