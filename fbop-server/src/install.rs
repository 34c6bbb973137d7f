use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distributions::Alphanumeric;
use tinytemplate::TinyTemplate;

const EXAMPLE_CONFIG: &str = include_str!("../config.yaml.example");
const UNIT_TEMPLATE: &str = include_str!("../systemd/fbop-server.service");
const SWEEP_UNIT_TEMPLATE: &str = include_str!("../systemd/fbop-sweep.service");
const SWEEP_TIMER_TEMPLATE: &str = include_str!("../systemd/fbop-sweep.timer");

const SWEEP_UNIT_NAME: &str = "fbop-sweep.service";
const SWEEP_TIMER_NAME: &str = "fbop-sweep.timer";

pub struct InstallOptions<'a> {
    pub unit_path: &'a Path,
    pub timer_dir: &'a Path,
    pub schedule: &'a str,
    pub config_path: &'a Path,
    pub db_path: &'a Path,
    pub binary_path: &'a Path,
    pub user: &'a str,
    pub group: &'a str,
    pub working_dir: &'a Path,
    pub force: bool,
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

fn render_default_config() -> String {
    let secret = generate_secret();
    EXAMPLE_CONFIG.replace("change-this-to-a-long-random-secret", &secret)
}

#[derive(serde::Serialize)]
struct UnitCtx<'a> {
    binary_path: String,
    config_path: String,
    db_path: String,
    user: &'a str,
    group: &'a str,
    working_dir: String,
    schedule: &'a str,
}

fn render(name: &'static str, template: &'static str, ctx: &UnitCtx) -> Result<String, String> {
    let mut tt = TinyTemplate::new();
    // systemd units are plain text; no HTML escaping
    tt.set_default_formatter(&tinytemplate::format_unescaped);
    tt.add_template(name, template)
        .map_err(|e| format!("template: {e}"))?;
    tt.render(name, ctx).map_err(|e| format!("render: {e}"))
}

fn ensure_parent(path: &Path) -> Result<(), String> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(|e| format!("create dir {}: {}", dir.display(), e))?;
    }
    Ok(())
}

/// Writes `contents` unless the file exists and `force` is off.
fn write_file(path: &Path, contents: &str, force: bool, what: &str) -> Result<bool, String> {
    if path.exists() && !force {
        eprintln!(
            "{what} exists at {}; skipping (use --force to overwrite)",
            path.display()
        );
        return Ok(false);
    }
    ensure_parent(path)?;
    let mut f =
        fs::File::create(path).map_err(|e| format!("write {}: {}", path.display(), e))?;
    f.write_all(contents.as_bytes())
        .map_err(|e| format!("write {}: {}", path.display(), e))?;
    println!("Wrote {what} to {}", path.display());
    Ok(true)
}

pub fn install_system(opts: &InstallOptions) -> Result<(), String> {
    ensure_parent(opts.db_path)?;

    if write_file(
        opts.config_path,
        &render_default_config(),
        opts.force,
        "config",
    )? {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(opts.config_path, fs::Permissions::from_mode(0o640));
        }
    }

    let ctx = UnitCtx {
        binary_path: opts.binary_path.display().to_string(),
        config_path: opts.config_path.display().to_string(),
        db_path: opts.db_path.display().to_string(),
        user: opts.user,
        group: opts.group,
        working_dir: opts.working_dir.display().to_string(),
        schedule: opts.schedule,
    };
    write_file(
        opts.unit_path,
        &render("unit", UNIT_TEMPLATE, &ctx)?,
        opts.force,
        "unit",
    )?;
    write_file(
        &opts.timer_dir.join(SWEEP_UNIT_NAME),
        &render("sweep", SWEEP_UNIT_TEMPLATE, &ctx)?,
        opts.force,
        "sweep unit",
    )?;
    write_file(
        &opts.timer_dir.join(SWEEP_TIMER_NAME),
        &render("timer", SWEEP_TIMER_TEMPLATE, &ctx)?,
        opts.force,
        "sweep timer",
    )?;

    println!(
        "Done. Run: sudo systemctl daemon-reload && sudo systemctl enable --now fbop-server {SWEEP_TIMER_NAME}"
    );
    println!("Set `sweep.enabled: false` in the config when the timer does the sweeping.");
    Ok(())
}

fn remove_if_present(path: &Path, what: &str) -> Result<(), String> {
    if path.exists() {
        fs::remove_file(path).map_err(|e| format!("remove {}: {}", path.display(), e))?;
        println!("Removed {what} {}", path.display());
    } else {
        println!("{what} {} not found; skipping", path.display());
    }
    Ok(())
}

pub fn uninstall_system(
    unit_path: &Path,
    timer_dir: &Path,
    remove_config: bool,
    config_path: &Path,
) -> Result<(), String> {
    let units: [(PathBuf, &str); 3] = [
        (unit_path.to_path_buf(), "unit"),
        (timer_dir.join(SWEEP_UNIT_NAME), "sweep unit"),
        (timer_dir.join(SWEEP_TIMER_NAME), "sweep timer"),
    ];
    for (path, what) in &units {
        remove_if_present(path, what)?;
    }
    if remove_config {
        remove_if_present(config_path, "config")?;
    }
    println!(
        "Run: sudo systemctl daemon-reload && sudo systemctl disable --now fbop-server {SWEEP_TIMER_NAME}"
    );
    Ok(())
}
