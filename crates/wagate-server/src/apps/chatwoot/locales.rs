use serde::Serialize;

/// A helpdesk locale the app can post system notes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Locale {
    pub code: &'static str,
    pub name: &'static str,
    #[serde(skip)]
    pub missed_call: &'static str,
}

pub const DEFAULT_LOCALE: &str = "en";

pub const LOCALES: &[Locale] = &[
    Locale {
        code: "en",
        name: "English",
        missed_call: "Missed call",
    },
    Locale {
        code: "es",
        name: "Español",
        missed_call: "Llamada perdida",
    },
    Locale {
        code: "pt_BR",
        name: "Português (Brasil)",
        missed_call: "Chamada perdida",
    },
    Locale {
        code: "de",
        name: "Deutsch",
        missed_call: "Verpasster Anruf",
    },
    Locale {
        code: "fr",
        name: "Français",
        missed_call: "Appel manqué",
    },
    Locale {
        code: "id",
        name: "Bahasa Indonesia",
        missed_call: "Panggilan tak terjawab",
    },
    Locale {
        code: "ru",
        name: "Русский",
        missed_call: "Пропущенный звонок",
    },
    Locale {
        code: "uk",
        name: "Українська",
        missed_call: "Пропущений дзвінок",
    },
];

pub fn find(code: &str) -> Option<&'static Locale> {
    LOCALES.iter().find(|l| l.code.eq_ignore_ascii_case(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_locale_exists() {
        assert!(find(DEFAULT_LOCALE).is_some());
    }

    #[test]
    fn lookup_ignores_case() {
        assert_eq!(find("PT_br").unwrap().code, "pt_BR");
        assert!(find("xx").is_none());
    }

    #[test]
    fn codes_are_unique() {
        for (i, a) in LOCALES.iter().enumerate() {
            assert!(LOCALES[i + 1..].iter().all(|b| a.code != b.code));
        }
    }
}
