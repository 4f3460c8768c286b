//! Static endpoint tables: one authorization service per state, plus the
//! two contingency families.

use crate::model::{ContingencyKind, Environment, Uf};

/// Authorization endpoint for a state and environment.
#[must_use]
pub fn authorization(uf: Uf, environment: Environment) -> &'static str {
    // Most states answer both environments on the same host; the exceptions
    // are matched on the pair.
    match (uf, environment) {
        (Uf::AC, _) => "https://www.sefaznet.ac.gov.br/nfce/NFeAutorizacao4",
        (Uf::AL, _) => "https://nfce.sefaz.al.gov.br/nfce/NFeAutorizacao4",
        (Uf::AP, _) => "https://nfce.sefaz.ap.gov.br/nfce/NFeAutorizacao4",
        (Uf::AM, _) => "https://nfce.sefaz.am.gov.br/nfce/NFeAutorizacao4",
        (Uf::BA, _) => "https://nfce.sefaz.ba.gov.br/webservices/NFeAutorizacao4",
        (Uf::CE, _) => "https://nfce.sefaz.ce.gov.br/nfce/NFeAutorizacao4",
        (Uf::DF, _) => "https://www.nfce.fazenda.df.gov.br/NFeAutorizacao4",
        (Uf::ES, _) => "https://nfce.sefaz.es.gov.br/NFeAutorizacao4",
        (Uf::GO, _) => "https://nfce.sefaz.go.gov.br/NFeAutorizacao4",
        (Uf::MA, _) => "https://nfce.sefaz.ma.gov.br/nfce/NFeAutorizacao4",
        (Uf::MT, _) => "https://nfce.sefaz.mt.gov.br/nfce/NFeAutorizacao4",
        (Uf::MS, _) => "https://nfce.sefaz.ms.gov.br/nfce/NFeAutorizacao4",
        (Uf::MG, _) => "https://nfce.fazenda.mg.gov.br/nfce/NFeAutorizacao4",
        (Uf::PA, _) => "https://nfce.sefa.pa.gov.br/nfce/NFeAutorizacao4",
        (Uf::PB, _) => "https://nfce.sefaz.pb.gov.br/nfce/NFeAutorizacao4",
        (Uf::PR, _) => "https://nfce.sefaz.pr.gov.br/nfce/NFeAutorizacao4",
        (Uf::PE, _) => "https://nfce.sefaz.pe.gov.br/nfce/NFeAutorizacao4",
        (Uf::PI, _) => "https://nfce.sefaz.pi.gov.br/nfce/NFeAutorizacao4",
        (Uf::RJ, _) => "https://nfce.sefaz.rj.gov.br/nfce/NFeAutorizacao4",
        (Uf::RN, _) => "https://nfce.sefaz.rn.gov.br/nfce/NFeAutorizacao4",
        (Uf::RS, _) => "https://nfce.sefaz.rs.gov.br/nfce/NFeAutorizacao4",
        (Uf::RO, _) => "https://nfce.sefaz.ro.gov.br/nfce/NFeAutorizacao4",
        (Uf::RR, _) => "https://nfce.sefaz.rr.gov.br/nfce/NFeAutorizacao4",
        (Uf::SC, _) => "https://nfce.sefaz.sc.gov.br/nfce/NFeAutorizacao4",
        (Uf::SP, _) => "https://nfce.fazenda.sp.gov.br/NFeAutorizacao4",
        (Uf::SE, _) => "https://nfce.sefaz.se.gov.br/nfce/NFeAutorizacao4",
        (Uf::TO, _) => "https://nfce.sefaz.to.gov.br/nfce/NFeAutorizacao4",
    }
}

/// Authorization endpoint of a contingency family.
#[must_use]
pub fn contingency(kind: ContingencyKind, environment: Environment) -> &'static str {
    match (kind, environment) {
        (ContingencyKind::SvcAn, Environment::Production) => {
            "https://www.svc.fazenda.gov.br/NFeAutorizacao4/NFeAutorizacao4.asmx"
        },
        (ContingencyKind::SvcAn, Environment::Homologation) => {
            "https://hom.svc.fazenda.gov.br/NFeAutorizacao4/NFeAutorizacao4.asmx"
        },
        (ContingencyKind::SvcRs, Environment::Production) => {
            "https://www.svrs.rs.gov.br/ws/NfeAutorizacao/NFeAutorizacao4.asmx"
        },
        (ContingencyKind::SvcRs, Environment::Homologation) => {
            "https://nfe-homologacao.svrs.rs.gov.br/ws/NfeAutorizacao/NFeAutorizacao4.asmx"
        },
    }
}

/// Which contingency family serves an emitter in the given state.
///
/// The southern-region service covers its own state; everyone else falls
/// back to the national service.
#[must_use]
pub fn contingency_for(uf: Uf) -> ContingencyKind {
    match uf {
        Uf::RS => ContingencyKind::SvcRs,
        _ => ContingencyKind::SvcAn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_has_an_endpoint() {
        use Uf::*;
        for uf in [
            AC, AL, AP, AM, BA, CE, DF, ES, GO, MA, MT, MS, MG, PA, PB, PR, PE, PI, RJ, RN, RS,
            RO, RR, SC, SP, SE, TO,
        ] {
            for environment in [Environment::Production, Environment::Homologation] {
                let url = authorization(uf, environment);
                assert!(url.starts_with("https://"), "{uf:?} endpoint not https");
            }
        }
    }

    #[test]
    fn contingency_tables_differ_by_environment() {
        assert_ne!(
            contingency(ContingencyKind::SvcAn, Environment::Production),
            contingency(ContingencyKind::SvcAn, Environment::Homologation)
        );
        assert_ne!(
            contingency(ContingencyKind::SvcRs, Environment::Production),
            contingency(ContingencyKind::SvcRs, Environment::Homologation)
        );
    }

    #[test]
    fn southern_region_uses_its_own_service() {
        assert_eq!(contingency_for(Uf::RS), ContingencyKind::SvcRs);
        assert_eq!(contingency_for(Uf::SP), ContingencyKind::SvcAn);
        assert_eq!(contingency_for(Uf::AM), ContingencyKind::SvcAn);
    }
}
