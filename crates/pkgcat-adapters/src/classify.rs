//! Keyword-based GUI/CLI inference for sources that don't say.

use pkgcat_core::PackageType;

/// Checked first; a hit here wins over any CLI keyword. "editor" stays in this
/// list, so terminal editors land in `gui`.
const GUI_KEYWORDS: &[&str] = &[
    "browser",
    "editor",
    "gui",
    "gtk",
    "gtk3",
    "gtk4",
    "qt",
    "qt5",
    "qt6",
    "kde",
    "gnome",
    "xfce",
    "desktop",
    "graphical",
    "x11",
    "wayland",
    "viewer",
    "player",
    "game",
    "office",
    "spreadsheet",
    "paint",
    "drawing",
    "photo",
    "ide",
];

const CLI_KEYWORDS: &[&str] = &[
    "cli",
    "command",
    "commandline",
    "console",
    "terminal",
    "shell",
    "daemon",
    "library",
    "utility",
    "utilities",
    "tool",
    "tools",
    "server",
];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_ascii_lowercase())
}

/// First keyword from `keywords` appearing as a whole word in name or description.
fn first_match(name: &str, description: &str, keywords: &[&'static str]) -> Option<&'static str> {
    words(name)
        .chain(words(description))
        .find_map(|word| keywords.iter().copied().find(|k| *k == word))
}

pub fn matched_gui_keyword(name: &str, description: &str) -> Option<&'static str> {
    first_match(name, description, GUI_KEYWORDS)
}

pub fn classify_package_type(name: &str, description: &str) -> PackageType {
    if matched_gui_keyword(name, description).is_some() {
        return PackageType::Gui;
    }
    if first_match(name, description, CLI_KEYWORDS).is_some() {
        return PackageType::Cli;
    }
    PackageType::Cli
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browsers_and_editors_are_gui() {
        assert_eq!(
            classify_package_type("firefox", "Mozilla Firefox web browser"),
            PackageType::Gui
        );
        assert_eq!(
            matched_gui_keyword("vim", "Vi IMproved - enhanced vi editor"),
            Some("editor")
        );
        assert_eq!(
            classify_package_type("vim", "Vi IMproved - enhanced vi editor"),
            PackageType::Gui
        );
    }

    #[test]
    fn gui_keywords_win_on_overlap() {
        assert_eq!(
            classify_package_type("foo", "command line tool with a GTK frontend"),
            PackageType::Gui
        );
    }

    #[test]
    fn keywords_match_whole_words_only() {
        // "provides" contains "ide", "guide" contains "gui".
        assert_eq!(
            classify_package_type("docs", "provides a user guide"),
            PackageType::Cli
        );
    }

    #[test]
    fn keywords_fused_into_package_names_do_not_count() {
        assert_eq!(classify_package_type("libgtk-3-0", ""), PackageType::Cli);
        assert_eq!(classify_package_type("kdeconnect", ""), PackageType::Cli);
        assert_eq!(classify_package_type("qtcreator", ""), PackageType::Cli);
        // separated by punctuation or spaces, the same keywords hit
        assert_eq!(classify_package_type("gtk-theme-switch", ""), PackageType::Gui);
        assert_eq!(matched_gui_keyword("kdeconnect", "KDE Connect"), Some("kde"));
    }

    #[test]
    fn unknown_packages_default_to_cli() {
        assert_eq!(classify_package_type("libfoo0", ""), PackageType::Cli);
        assert_eq!(classify_package_type("tmux", "terminal multiplexer"), PackageType::Cli);
    }
}
