//! Companion applications for the `open` built-in.

use std::path::Path;

#[cfg(target_os = "macos")]
const COMPANION_APPS: &[(&str, &str)] = &[
    ("html", "Safari"),
    ("htm", "Safari"),
    ("pdf", "Preview"),
    ("png", "Preview"),
    ("jpg", "Preview"),
    ("jpeg", "Preview"),
    ("gif", "Preview"),
    ("svg", "Safari"),
    ("webp", "Preview"),
    ("mp3", "Music"),
    ("wav", "Music"),
    ("mp4", "QuickTime Player"),
    ("mov", "QuickTime Player"),
    ("csv", "Numbers"),
    ("xlsx", "Numbers"),
    ("docx", "Pages"),
];
#[cfg(target_os = "macos")]
const DEFAULT_APP: &str = "TextEdit";

#[cfg(windows)]
const COMPANION_APPS: &[(&str, &str)] = &[
    ("html", "msedge"),
    ("htm", "msedge"),
    ("pdf", "msedge"),
    ("svg", "msedge"),
    ("png", "mspaint"),
    ("jpg", "mspaint"),
    ("jpeg", "mspaint"),
    ("gif", "mspaint"),
    ("bmp", "mspaint"),
    ("mp3", "wmplayer"),
    ("mp4", "wmplayer"),
    ("csv", "excel"),
    ("xlsx", "excel"),
    ("docx", "winword"),
];
#[cfg(windows)]
const DEFAULT_APP: &str = "notepad";

#[cfg(not(any(target_os = "macos", windows)))]
const COMPANION_APPS: &[(&str, &str)] = &[
    ("html", "firefox"),
    ("htm", "firefox"),
    ("svg", "firefox"),
    ("pdf", "evince"),
    ("png", "eog"),
    ("jpg", "eog"),
    ("jpeg", "eog"),
    ("gif", "eog"),
    ("webp", "eog"),
    ("mp3", "vlc"),
    ("wav", "vlc"),
    ("mp4", "vlc"),
    ("mkv", "vlc"),
    ("csv", "libreoffice"),
    ("xlsx", "libreoffice"),
    ("docx", "libreoffice"),
];
#[cfg(not(any(target_os = "macos", windows)))]
const DEFAULT_APP: &str = "gedit";

/// Application registered for the file's extension, or the default viewer.
pub fn companion_app(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    COMPANION_APPS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, app)| *app)
        .unwrap_or(DEFAULT_APP)
}

/// Shell command line that launches `app` on `path` without waiting for it.
pub fn launch_command(app: &str, path: &Path) -> String {
    let file = path.to_string_lossy();
    #[cfg(target_os = "macos")]
    {
        format!("open -a {} {}", shell_quote(app), shell_quote(&file))
    }
    #[cfg(windows)]
    {
        format!("start \"\" \"{}\" \"{}\"", app, file)
    }
    #[cfg(not(any(target_os = "macos", windows)))]
    {
        format!(
            "nohup {} {} >/dev/null 2>&1 &",
            shell_quote(app),
            shell_quote(&file)
        )
    }
}

/// Single-quote a word for a POSIX shell.
#[cfg_attr(windows, allow(dead_code))]
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_extension_uses_default_viewer() {
        assert_eq!(companion_app(Path::new("notes.txt")), DEFAULT_APP);
        assert_eq!(companion_app(Path::new("Makefile")), DEFAULT_APP);
    }

    #[test]
    fn extension_lookup_ignores_case() {
        let (ext, app) = COMPANION_APPS[0];
        assert_eq!(companion_app(Path::new(&format!("index.{}", ext))), app);
        assert_eq!(
            companion_app(Path::new(&format!("INDEX.{}", ext.to_uppercase()))),
            app
        );
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    #[test]
    fn launch_detaches_from_the_shell() {
        let cmd = launch_command("gedit", Path::new("/proj/a b.txt"));
        assert_eq!(cmd, "nohup 'gedit' '/proj/a b.txt' >/dev/null 2>&1 &");
    }
}
