/// Nick colors. Readable on both light and dark backgrounds.
pub const PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#42d4f4",
    "#f032e6", "#469990", "#9a6324", "#800000", "#808000", "#000075",
];

/// Deterministic color for a nick, stable across reconnects and instances.
pub fn nick_color(nick: &str) -> &'static str {
    let hash = nick
        .chars()
        .fold(0i32, |hash, c| (c as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash)));
    PALETTE[hash.unsigned_abs() as usize % PALETTE.len()]
}
