use fake::Fake;
use fake::faker::address::raw::{BuildingNumber, CityName, CountryName, StreetName, ZipCode};
use fake::faker::company::raw::CompanyName;
use fake::faker::internet::raw::{FreeEmail, IPv4, SafeEmail, Username};
use fake::faker::lorem::raw::{Paragraph, Sentence, Word};
use fake::faker::name::raw::{FirstName, LastName, Name};
use fake::faker::phone_number::raw::{CellNumber, PhoneNumber};
use fake::locales::{EN, PT_BR};
use rand::RngCore;

use crate::errors::GenerationError;

/// Locales the catalog can generate for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocaleKey {
    EnUs,
    PtBr,
}

impl LocaleKey {
    pub fn parse(value: &str) -> Result<Self, GenerationError> {
        match value {
            "en_US" | "en" => Ok(Self::EnUs),
            "pt_BR" | "pt" => Ok(Self::PtBr),
            other => Err(GenerationError::UnknownLocale(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnUs => "en_US",
            Self::PtBr => "pt_BR",
        }
    }
}

/// Runs a raw `fake` faker with the locale picked at runtime.
macro_rules! localized {
    ($locale:expr, $rng:expr, |$l:ident| $faker:expr) => {
        match $locale {
            LocaleKey::EnUs => {
                let $l = EN;
                $faker.fake_with_rng::<String, _>($rng)
            }
            LocaleKey::PtBr => {
                let $l = PT_BR;
                $faker.fake_with_rng::<String, _>($rng)
            }
        }
    };
}

/// Provider ids accepted by `faker` rules.
pub const PROVIDERS: &[&str] = &[
    "cell_number",
    "city",
    "company",
    "country",
    "first_name",
    "free_email",
    "ipv4",
    "last_name",
    "name",
    "paragraph",
    "phone_number",
    "postcode",
    "safe_email",
    "sentence",
    "street_address",
    "street_name",
    "user_name",
    "word",
];

/// Maps provider ids onto `fake` fakers.
pub struct FakerCatalog;

impl FakerCatalog {
    pub fn providers() -> &'static [&'static str] {
        PROVIDERS
    }

    pub fn contains(provider: &str) -> bool {
        PROVIDERS.binary_search(&provider).is_ok()
    }

    pub fn validate(provider: &str, locale: &str) -> Result<(), GenerationError> {
        if !Self::contains(provider) {
            return Err(GenerationError::UnknownProvider(provider.to_string()));
        }
        LocaleKey::parse(locale).map(|_| ())
    }

    pub fn generate(
        provider: &str,
        locale: LocaleKey,
        rng: &mut dyn RngCore,
    ) -> Result<String, GenerationError> {
        let value = match provider {
            "cell_number" => localized!(locale, rng, |l| CellNumber(l)),
            "city" => localized!(locale, rng, |l| CityName(l)),
            "company" => localized!(locale, rng, |l| CompanyName(l)),
            "country" => localized!(locale, rng, |l| CountryName(l)),
            "first_name" => localized!(locale, rng, |l| FirstName(l)),
            "free_email" => localized!(locale, rng, |l| FreeEmail(l)),
            "ipv4" => localized!(locale, rng, |l| IPv4(l)),
            "last_name" => localized!(locale, rng, |l| LastName(l)),
            "name" => localized!(locale, rng, |l| Name(l)),
            "paragraph" => localized!(locale, rng, |l| Paragraph(l, 2..4)),
            "phone_number" => localized!(locale, rng, |l| PhoneNumber(l)),
            "postcode" => localized!(locale, rng, |l| ZipCode(l)),
            "safe_email" => localized!(locale, rng, |l| SafeEmail(l)),
            "sentence" => localized!(locale, rng, |l| Sentence(l, 4..10)),
            "street_address" => {
                let number = localized!(locale, rng, |l| BuildingNumber(l));
                let street = localized!(locale, rng, |l| StreetName(l));
                format!("{number} {street}")
            }
            "street_name" => localized!(locale, rng, |l| StreetName(l)),
            "user_name" => localized!(locale, rng, |l| Username(l)),
            "word" => localized!(locale, rng, |l| Word(l)),
            other => return Err(GenerationError::UnknownProvider(other.to_string())),
        };
        Ok(value)
    }
}
