/// Hides the middle of a contact number or id for public listings.
/// The first two and last two characters stay visible; four characters or
/// fewer are starred entirely.
pub fn mask_sensitive(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let n = chars.len();
    if n <= 4 {
        return "*".repeat(n);
    }
    let mut out = String::with_capacity(n);
    out.extend(&chars[..2]);
    out.push_str(&"*".repeat(n - 4));
    out.extend(&chars[n - 2..]);
    out
}
