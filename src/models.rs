pub mod coin_amount;
pub mod node;
pub mod transaction_record;
