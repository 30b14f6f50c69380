use std::env;
use std::process::Command;

fn main() {
    // pyo3's own build script picks the interpreter; we only make sure the
    // linker can find libpython when it lives outside the default paths
    // (framework builds, pyenv, conda).
    println!("cargo:rerun-if-env-changed=PYO3_PYTHON");
    let python = env::var("PYO3_PYTHON").unwrap_or_else(|_| "python3".to_string());

    let libdir = Command::new(&python)
        .args([
            "-c",
            "import sysconfig; print(sysconfig.get_config_var('LIBDIR'))",
        ])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string());

    match libdir {
        Some(dir) if !dir.is_empty() && dir != "None" => {
            println!("cargo:rustc-link-search=native={dir}");
        }
        _ => println!("cargo:warning=could not locate the Python library directory via {python}"),
    }
}
