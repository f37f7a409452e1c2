// src/banner.rs

/// Prints the startup banner to the console.
pub fn print_banner() {
    let banner = r#"
             _       _
 _ __  _   _| | __ _| |__
| '_ \| | | | |/ _` | '_ \
| |_) | |_| | | (_| | |_) |
| .__/ \__, |_|\__,_|_.__/
|_|    |___/

    Virtual Python Lab - code runner
"#;
    eprintln!("{}", banner);
}
