// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Delivery client: transport state independent of what is being sent

pub mod client;
pub mod types;

pub use client::ReqwestHttpClient;
pub use types::{
    classify, CallOutcome, CallResult, Completion, HttpRequest, HttpResponse, PendingCall,
};

/// Asynchronous HTTP transport with enable/disable and pause/resume state.
///
/// "Enabled" decides whether the client may be used at all; "paused"
/// temporarily withholds sending. Retry classification is reported through
/// the result, but rescheduling is left to the caller.
pub trait HttpClient: Send + Sync {
    /// Start a call. Never blocks; the returned handle resolves exactly once.
    ///
    /// # Arguments
    /// * `request` - URL, method, headers and body of the call
    fn send_async(&self, request: HttpRequest) -> PendingCall;

    /// Callback flavour of `send_async`. The completion runs on a spawned
    /// task, after this method has returned.
    fn send_with_completion(&self, request: HttpRequest, completion: Completion) {
        let call = self.send_async(request);
        tokio::spawn(async move {
            completion(call.await);
        });
    }

    /// Hold new calls until `resume`. Does not change the enabled state.
    fn pause(&self);

    fn resume(&self);

    /// Disabling cancels every outstanding call with `Disabled` and rejects
    /// new calls. Re-enabling does not replay canceled calls.
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    fn is_paused(&self) -> bool;
}
