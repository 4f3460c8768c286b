//! Domain model: the request aggregate, its payload, and its event log.

mod company;
mod event;
mod payload;
mod request;

pub use company::{Address, CertificateRef, Company, ContributorSecret};
pub use event::{replay, Event};
pub use payload::{
    Environment, Item, ItemTaxes, Payment, PaymentCard, SaleIssuer, SalePayload, Uf,
};

#[cfg(test)]
pub(crate) use company::sample_company;
#[cfg(test)]
pub(crate) use payload::sample_payload;
pub use request::{ContingencyKind, Request, RequestStatus};
