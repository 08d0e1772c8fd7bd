pub mod running_mean;
