pub(crate) mod ctl;
pub(crate) mod run;
pub(crate) mod unit;
