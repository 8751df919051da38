//! Console channel adapter: delivers responses to stdout for local use.

use async_trait::async_trait;

use valet_core::{ChannelAdapter, MessageContext, ValetError};

pub struct ConsoleChannel;

#[async_trait]
impl ChannelAdapter for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, context: &MessageContext, text: &str) -> Result<(), ValetError> {
        match context.sender.as_deref() {
            Some(sender) => println!("[{}] {}", sender, text),
            None => println!("{}", text),
        }
        Ok(())
    }
}
