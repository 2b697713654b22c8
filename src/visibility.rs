use std::collections::HashSet;

use portage_atom::Slot;
use tracing::{debug, warn};

use crate::atom::{parse_slot, Atom};
use crate::config::{stack_incrementals, Settings, UseConfig, UseResolver};
use crate::cpv::Cpv;
use crate::eapi::Eapi;
use crate::error::{Error, Result};
use crate::iuse::IUse;
use crate::keyword::{check_keywords, Keyword};
use crate::license::{LicenseAcceptance, LicenseExpr};
use crate::store::MetadataStore;

/// Decides which versions a user may select.
///
/// Two independent passes: [`mask_filter`](Self::mask_filter) applies
/// `package.mask`, `package.unmask` and the profile's version pins;
/// [`keyword_filter`](Self::keyword_filter) applies keywords, licenses and
/// EAPI support. Both keep the input order.
pub struct VisibilityFilter {
    settings: Settings,
    use_resolver: Box<dyn UseResolver>,
}

impl VisibilityFilter {
    pub fn new(settings: Settings) -> Self {
        let use_resolver = Box::new(UseConfig::from_settings(&settings));
        VisibilityFilter {
            settings,
            use_resolver,
        }
    }

    /// Resolve USE for conditional `LICENSE` values with `resolver`.
    pub fn with_use_resolver(mut self, resolver: Box<dyn UseResolver>) -> Self {
        self.use_resolver = resolver;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Drop candidates hit by a mask atom that no unmask atom reinstates,
    /// then keep only those satisfying every profile pin of their package.
    pub fn mask_filter(&self, store: &mut MetadataStore, candidates: &[Cpv]) -> Result<Vec<Cpv>> {
        let mut visible = Vec::with_capacity(candidates.len());
        for cpv in candidates {
            let cp = cpv.cp();
            let masks = self.settings.package_mask.atoms(&cp);
            if let Some(mask) = first_match(store, masks, cpv, true)? {
                let unmasks = self.settings.package_unmask.atoms(&cp);
                if first_match(store, unmasks, cpv, true)?.is_none() {
                    debug!(%cpv, %mask, "masked");
                    continue;
                }
            }
            let pins = self.settings.profile_packages.atoms(&cp);
            if let Some(pin) = first_match(store, pins, cpv, false)? {
                debug!(%cpv, %pin, "outside profile pin");
                continue;
            }
            visible.push(cpv.clone());
        }
        Ok(visible)
    }

    /// Keep candidates whose keywords are accepted, whose licenses are
    /// accepted and whose EAPI is supported. Candidates that do not exist
    /// are dropped; any other metadata failure is returned.
    pub fn keyword_filter(
        &self,
        store: &mut MetadataStore,
        candidates: &[Cpv],
    ) -> Result<Vec<Cpv>> {
        let mut visible = Vec::with_capacity(candidates.len());
        for cpv in candidates {
            let values = match store.aux_get(cpv, &["KEYWORDS", "LICENSE", "EAPI", "SLOT"], None) {
                Ok(values) => values,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let Ok([keywords, license, eapi, slot]) = <[String; 4]>::try_from(values) else {
                continue;
            };

            if !self.keywords_accepted(cpv, &keywords, &slot)
                || !self.license_accepted(store, cpv, &license)?
            {
                continue;
            }
            if !Eapi::is_supported(&eapi) {
                debug!(%cpv, %eapi, "unsupported EAPI");
                continue;
            }
            visible.push(cpv.clone());
        }
        Ok(visible)
    }

    /// Both passes, masks first.
    pub fn visible(&self, store: &mut MetadataStore, candidates: &[Cpv]) -> Result<Vec<Cpv>> {
        let unmasked = self.mask_filter(store, candidates)?;
        self.keyword_filter(store, &unmasked)
    }

    /// `ACCEPT_KEYWORDS` for `cpv`, with matching `package.accept_keywords`
    /// entries and the calling environment's value stacked on top.
    pub fn accepted_keywords(&self, cpv: &Cpv, slot: &str) -> Vec<String> {
        let mut groups = self.settings.accept_keywords.clone();
        let cp = cpv.cp();
        if !self.settings.package_keywords.contains_key(&cp) {
            return groups;
        }
        let slot = parse_slot(slot);
        let mut matched = false;
        for (atom, keywords) in self.settings.package_keywords.for_key(&cp) {
            if atom_matches_slotted(atom, cpv, slot.as_ref()) {
                groups.extend(keywords.iter().cloned());
                matched = true;
            }
        }
        groups.extend(self.settings.backup_accept_keywords.iter().cloned());
        if matched {
            groups = stack_incrementals(groups);
        }
        groups
    }

    fn keywords_accepted(&self, cpv: &Cpv, keywords: &str, slot: &str) -> bool {
        let keywords = match Keyword::parse_line(keywords) {
            Ok(keywords) => keywords,
            Err(err) => {
                warn!(%cpv, %err, "invalid KEYWORDS");
                return false;
            }
        };
        let accepted = self.accepted_keywords(cpv, slot);
        let check = check_keywords(&keywords, &accepted);
        if let Some(wildcard) = check.wildcard {
            warn!(%cpv, keyword = %wildcard, "package uses a wildcard keyword");
        }
        if !check.accepted {
            debug!(%cpv, "keywords not accepted");
        }
        check.accepted
    }

    fn license_accepted(
        &self,
        store: &mut MetadataStore,
        cpv: &Cpv,
        license: &str,
    ) -> Result<bool> {
        let expr = match LicenseExpr::parse(license) {
            Ok(expr) => expr,
            Err(err) => {
                warn!(%cpv, %err, "invalid LICENSE");
                return Ok(false);
            }
        };
        let use_flags = if expr.is_conditional() {
            let iuse = match store.aux_get(cpv, &["IUSE"], None) {
                Ok(values) => values,
                Err(Error::NotFound(_)) => Vec::new(),
                Err(err) => return Err(err),
            };
            let iuse = iuse
                .first()
                .and_then(|value| IUse::parse_line(value).ok())
                .unwrap_or_default();
            self.use_resolver.use_flags(cpv, &iuse)
        } else {
            HashSet::new()
        };

        let groups = &self.settings.license_groups;
        let mut acceptance = LicenseAcceptance::with_groups(&self.settings.accept_license, groups);
        for (atom, licenses) in self.settings.package_license.for_key(&cpv.cp()) {
            if atom.matches(cpv) {
                acceptance.extend(licenses, groups);
            }
        }

        let missing = expr.missing(&acceptance, &use_flags);
        if !missing.is_empty() {
            debug!(%cpv, missing = %missing.join(" "), "license not accepted");
        }
        Ok(missing.is_empty())
    }
}

/// The first of `atoms` whose match against `cpv` equals `wanted`.
fn first_match<'a>(
    store: &mut MetadataStore,
    atoms: impl Iterator<Item = &'a Atom>,
    cpv: &Cpv,
    wanted: bool,
) -> Result<Option<&'a Atom>> {
    for atom in atoms {
        if store.matches_atom(atom, cpv)? == wanted {
            return Ok(Some(atom));
        }
    }
    Ok(None)
}

/// Match against a known `SLOT` value without another metadata lookup.
fn atom_matches_slotted(atom: &Atom, cpv: &Cpv, slot: Option<&Slot>) -> bool {
    atom.matches(cpv)
        && match (&atom.slot, slot) {
            (None, _) => true,
            (Some(_), Some(slot)) => atom.matches_slot(slot),
            (Some(_), None) => false,
        }
}
