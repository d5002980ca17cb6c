pub mod fixtures;

#[cfg(test)]
mod peer_discovery_tests;
#[cfg(test)]
mod signal_tests;
#[cfg(test)]
mod ws_tests;
#[cfg(test)]
mod client_scenario_tests;
