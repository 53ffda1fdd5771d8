use std::fmt::Write as _;

use super::engine::CONFLICT_SENTINEL;
use crate::geo::{GeoContext, Poi};

const BASE_INSTRUCTIONS: &str = "You identify the real-world place shown in a photo.\n\
Return JSON with:\n\
- photoContext: a neutral visual description of the photo (architecture, landscape, signage, \
weather, people, objects). Do not name or guess the place in this field.\n\
- candidates: exactly 3 place candidates ranked best first. Each has name, why (the visual \
cues that support it), confidence between 0 and 1, and searchQuery (a short image search query).";

fn poi_lines(pois: &[Poi]) -> String {
    let mut out = String::new();
    for (i, poi) in pois.iter().enumerate() {
        let _ = write!(out, "{}. {} ({}, {} m", i + 1, poi.name, poi.kind, poi.distance_m);
        if !poi.hint.is_empty() {
            let _ = write!(out, "; {}", poi.hint);
        }
        out.push_str(")\n");
    }
    out
}

fn grounding_rule() -> String {
    format!(
        "HARD CONSTRAINT: every candidate name MUST be taken from the nearby places list. \
Only if the visual evidence clearly contradicts the coordinates may you propose other places; \
in that case the why field must contain the phrase \"{}\" and confidence must be at most 0.2.",
        CONFLICT_SENTINEL
    )
}

fn location_section(geo: &GeoContext) -> String {
    let mut out = String::from("Location evidence from the photo's GPS coordinates:\n");
    let reverse = &geo.reverse;
    if let Some(name) = &reverse.display_name {
        let _ = writeln!(out, "Address: {}", name);
    }
    let area: Vec<&str> = [&reverse.city, &reverse.state, &reverse.country]
        .into_iter()
        .filter_map(|f| f.as_deref())
        .collect();
    if !area.is_empty() {
        let _ = writeln!(out, "Area: {}", area.join(", "));
    }
    if geo.has_pois() {
        let _ = writeln!(out, "Nearby places within {} m, nearest first:", geo.radius_m);
        out.push_str(&poi_lines(&geo.pois));
        out.push_str(&grounding_rule());
        out.push('\n');
    } else {
        let _ = writeln!(
            out,
            "No named places were found within {} m. Use the address as a strong hint.",
            geo.radius_m
        );
    }
    out
}

fn user_section(user_text: &str) -> String {
    let text = user_text.trim();
    if text.is_empty() {
        String::new()
    } else {
        format!("User note: {}\n", text)
    }
}

/// Primary identification prompt. `geo` is `None` when the upload had no coordinates.
pub fn identify_prompt(user_text: &str, geo: Option<&GeoContext>) -> String {
    let mut prompt = String::from(BASE_INSTRUCTIONS);
    prompt.push_str("\n\n");
    match geo {
        Some(geo) => prompt.push_str(&location_section(geo)),
        None => prompt.push_str(
            "No location is available. Rely only on visual cues in the photo and the user's note.\n",
        ),
    }
    prompt.push_str(&user_section(user_text));
    prompt
}

/// Stricter re-query used when the first answer ignored the nearby places list.
pub fn repair_prompt(user_text: &str, geo: &GeoContext) -> String {
    let mut prompt = String::from(BASE_INSTRUCTIONS);
    prompt.push_str(
        "\n\nYour previous answer ignored the location evidence. Choose the 3 candidates from this list:\n",
    );
    prompt.push_str(&poi_lines(&geo.pois));
    prompt.push_str(&grounding_rule());
    prompt.push('\n');
    prompt.push_str(&user_section(user_text));
    prompt
}
