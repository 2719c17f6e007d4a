use serde::Serialize;
use std::io::Write;

/// Print `value` as JSON on stdout, or write it to `path`.
pub fn emit<T: Serialize>(value: &T, compact: bool, path: Option<&str>) -> Result<(), String> {
    let json = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
    .map_err(|e| format!("JSON serialization failed: {}", e))?;

    if let Some(path) = path {
        return std::fs::write(path, json)
            .map_err(|e| format!("Failed to write output file '{}': {}", path, e));
    }

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", json).map_err(|e| format!("Failed to write to stdout: {}", e))
}

/// Print summary lines on stdout
pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}
