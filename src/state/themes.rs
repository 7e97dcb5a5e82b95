//! Built-in theme catalogue. Admin-managed content lives outside this
//! service; the game only ever reads these.

use crate::types::{Theme, ThemeIcon};

fn theme(id: &str, name: &str, whisps: &[&str], icons: &[(&str, &str)]) -> Theme {
    Theme {
        id: id.to_string(),
        name: name.to_string(),
        whisps: whisps.iter().map(|w| w.to_string()).collect(),
        icons: icons
            .iter()
            .map(|(id, name)| ThemeIcon {
                id: id.to_string(),
                name: name.to_string(),
            })
            .collect(),
    }
}

pub fn seed_catalogue() -> Vec<Theme> {
    vec![
        theme(
            "travel",
            "Travel",
            &[
                "Passport", "Luggage", "Jetlag", "Souvenir", "Layover", "Compass",
            ],
            &[
                ("travel_plane", "Airplane"),
                ("travel_map", "Map"),
                ("travel_suitcase", "Suitcase"),
                ("travel_camera", "Camera"),
                ("travel_beach", "Beach"),
                ("travel_ticket", "Ticket"),
            ],
        ),
        theme(
            "kitchen",
            "Kitchen",
            &["Whisk", "Colander", "Simmer", "Marinade", "Spatula", "Zest"],
            &[
                ("kitchen_pot", "Pot"),
                ("kitchen_knife", "Knife"),
                ("kitchen_oven", "Oven"),
                ("kitchen_salt", "Salt"),
                ("kitchen_egg", "Egg"),
                ("kitchen_apron", "Apron"),
            ],
        ),
        theme(
            "ocean",
            "Ocean",
            &["Undertow", "Plankton", "Anchor", "Driftwood", "Barnacle", "Tide"],
            &[
                ("ocean_wave", "Wave"),
                ("ocean_shell", "Shell"),
                ("ocean_fish", "Fish"),
                ("ocean_boat", "Boat"),
                ("ocean_coral", "Coral"),
                ("ocean_lighthouse", "Lighthouse"),
            ],
        ),
        theme(
            "music",
            "Music",
            &["Encore", "Falsetto", "Metronome", "Crescendo", "Riff", "Chorus"],
            &[
                ("music_guitar", "Guitar"),
                ("music_drum", "Drum"),
                ("music_mic", "Microphone"),
                ("music_note", "Note"),
                ("music_piano", "Piano"),
                ("music_stage", "Stage"),
            ],
        ),
    ]
}
