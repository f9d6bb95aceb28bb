pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}

/// Renders a number with Rust's shortest round-trip formatting, except that integral values carry
/// no fractional part: `42.0` becomes `"42"` and `1.5` stays `"1.5"`. Exponent notation is never
/// used, so `1e21` prints all 22 digits.
pub(crate) fn format_number(n: f64) -> String {
    if n == 0.0 {
        // -0 and 0 render identically
        return "0".to_string();
    }
    format!("{}", n)
}
