pub mod escrow;
pub mod ledger;
pub mod logging;

pub mod proto {
    pub mod v1 {
        tonic::include_proto!("asset_escrow.v1");
    }
}
