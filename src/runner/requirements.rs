/// Parse a requirements list into installable package entries.
///
/// Lines are trimmed; blank lines and `#` comments are discarded. Order is
/// preserved because later requirements may depend on earlier ones being
/// present in the same environment.
pub fn parse_requirements(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
